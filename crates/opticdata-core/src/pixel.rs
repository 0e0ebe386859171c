//! First-party pixel script generation.
//!
//! The emitted JavaScript is a stable browser contract: cookie names,
//! batch sizes, and flush triggers are depended on by tags already
//! deployed on merchant sites. Change the template with care.

/// The browser tag. `__SITE_TOKEN__` and `__EVENT_BASE__` are substituted
/// at serve time.
const PIXEL_TEMPLATE: &str = r"(function () {
  'use strict';
  if (window.__odtLoaded) { return; }
  window.__odtLoaded = true;

  var TOKEN = '__SITE_TOKEN__';
  var ENDPOINT = '__EVENT_BASE__';
  var BATCH_LIMIT = 20;
  var FLUSH_MS = 2000;
  var SESSION_IDLE_MS = 30 * 60 * 1000;
  var CLICK_KEYS = ['fbclid', 'gclid', 'ttclid', 'sclid', 'msclkid'];
  var UTM_KEYS = ['utm_source', 'utm_medium', 'utm_campaign', 'utm_content', 'utm_term'];

  var queue = [];
  var timer = null;

  function readCookie(name) {
    var parts = document.cookie.split('; ');
    for (var i = 0; i < parts.length; i++) {
      var eq = parts[i].indexOf('=');
      if (eq > 0 && parts[i].slice(0, eq) === name) {
        return decodeURIComponent(parts[i].slice(eq + 1));
      }
    }
    return null;
  }

  function writeCookie(name, value, days) {
    document.cookie = name + '=' + encodeURIComponent(value) +
      '; path=/; max-age=' + (days * 86400) + '; SameSite=Lax';
  }

  function uuid() {
    if (window.crypto && crypto.randomUUID) { return crypto.randomUUID(); }
    return 'xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx'.replace(/[xy]/g, function (ch) {
      var r = Math.random() * 16 | 0;
      return (ch === 'x' ? r : (r & 3 | 8)).toString(16);
    });
  }

  function anonymousId() {
    var id = readCookie('_odt_aid') || uuid();
    writeCookie('_odt_aid', id, 400);
    return id;
  }

  function sessionId() {
    var now = Date.now();
    var raw = readCookie('_odt_sid');
    var id = null;
    if (raw) {
      var dot = raw.lastIndexOf('.');
      var last = parseInt(raw.slice(dot + 1), 10);
      if (dot > 0 && last && now - last < SESSION_IDLE_MS) { id = raw.slice(0, dot); }
    }
    if (!id) { id = uuid(); }
    writeCookie('_odt_sid', id + '.' + now, 1);
    return id;
  }

  function fingerprint() {
    var raw = [screen.width, screen.height, screen.colorDepth,
      navigator.language, navigator.hardwareConcurrency || 0,
      navigator.maxTouchPoints || 0, new Date().getTimezoneOffset(),
      navigator.platform || ''].join('|');
    var hash = 5381;
    for (var i = 0; i < raw.length; i++) {
      hash = ((hash << 5) + hash + raw.charCodeAt(i)) >>> 0;
    }
    return hash.toString(16);
  }

  function urlParams() {
    var params = {};
    var query = location.search.replace(/^\?/, '');
    if (!query) { return params; }
    var pairs = query.split('&');
    for (var i = 0; i < pairs.length; i++) {
      var eq = pairs[i].indexOf('=');
      if (eq > 0) {
        try {
          params[decodeURIComponent(pairs[i].slice(0, eq))] =
            decodeURIComponent(pairs[i].slice(eq + 1).replace(/\+/g, ' '));
        } catch (err) { }
      }
    }
    return params;
  }

  function capture(keys, params) {
    var merged = {};
    for (var i = 0; i < keys.length; i++) {
      var key = keys[i];
      if (params[key]) { writeCookie('_odt_' + key, params[key], 90); }
      var value = params[key] || readCookie('_odt_' + key);
      if (value) { merged[key] = value; }
    }
    return merged;
  }

  function deviceType() {
    var ua = navigator.userAgent;
    if (/tablet|ipad/i.test(ua)) { return 'tablet'; }
    if (/mobi|android|iphone/i.test(ua)) { return 'mobile'; }
    return 'desktop';
  }

  function browserName() {
    var ua = navigator.userAgent;
    if (ua.indexOf('Edg/') >= 0) { return 'Edge'; }
    if (ua.indexOf('OPR/') >= 0) { return 'Opera'; }
    if (ua.indexOf('Chrome/') >= 0) { return 'Chrome'; }
    if (ua.indexOf('Safari/') >= 0 && ua.indexOf('Version/') >= 0) { return 'Safari'; }
    if (ua.indexOf('Firefox/') >= 0) { return 'Firefox'; }
    return 'Other';
  }

  function osName() {
    var ua = navigator.userAgent;
    if (/windows/i.test(ua)) { return 'Windows'; }
    if (/iphone|ipad|ipod/i.test(ua)) { return 'iOS'; }
    if (/android/i.test(ua)) { return 'Android'; }
    if (/mac os/i.test(ua)) { return 'macOS'; }
    if (/linux/i.test(ua)) { return 'Linux'; }
    return 'Other';
  }

  function sessionAttrs() {
    var params = urlParams();
    var clicks = capture(CLICK_KEYS, params);
    var utm = capture(UTM_KEYS, params);
    var tz = null;
    try { tz = Intl.DateTimeFormat().resolvedOptions().timeZone || null; } catch (err) { }
    return {
      ref: document.referrer || null,
      lp: location.href,
      us: utm.utm_source || null,
      um: utm.utm_medium || null,
      uc: utm.utm_campaign || null,
      uo: utm.utm_content || null,
      ut: utm.utm_term || null,
      fbc: clicks.fbclid || null,
      gc: clicks.gclid || null,
      ttc: clicks.ttclid || null,
      sc: clicks.sclid || null,
      msc: clicks.msclkid || null,
      dt: deviceType(),
      br: browserName(),
      os: osName(),
      sw: screen.width,
      sh: screen.height,
      tz: tz,
      ln: navigator.language || null
    };
  }

  var attrs = sessionAttrs();

  function post(url, body, useBeacon) {
    if (useBeacon && navigator.sendBeacon) {
      navigator.sendBeacon(url, new Blob([body], { type: 'application/json' }));
      return;
    }
    if (window.fetch) {
      fetch(url, {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: body,
        keepalive: true
      });
      return;
    }
    var xhr = new XMLHttpRequest();
    xhr.open('POST', url, true);
    xhr.setRequestHeader('Content-Type', 'application/json');
    xhr.send(body);
  }

  function flush(useBeacon) {
    if (timer) { clearTimeout(timer); timer = null; }
    if (!queue.length) { return; }
    var batch = queue.splice(0, queue.length);
    var body = JSON.stringify({
      token: TOKEN,
      aid: anonymousId(),
      sid: sessionId(),
      fp: fingerprint(),
      ts: Date.now(),
      session: attrs,
      events: batch
    });
    post(ENDPOINT + '/t/event', body, useBeacon);
  }

  function enqueue(evt) {
    queue.push(evt);
    if (queue.length >= BATCH_LIMIT) { flush(false); return; }
    if (!timer) { timer = setTimeout(function () { flush(false); }, FLUSH_MS); }
  }

  function take(props, key) {
    if (props[key] === undefined || props[key] === null) { return null; }
    var value = props[key];
    delete props[key];
    return value;
  }

  function track(name, props) {
    props = props ? JSON.parse(JSON.stringify(props)) : {};
    var evt = {
      n: name,
      u: location.href,
      t: document.title || null,
      r: document.referrer || null,
      ts: Date.now()
    };
    var eid = take(props, 'event_id'); if (eid) { evt.eid = eid; }
    var cat = take(props, 'category'); if (cat) { evt.c = cat; }
    var oid = take(props, 'order_id'); if (oid) { evt.oid = oid; }
    var rev = take(props, 'revenue'); if (rev !== null) { evt.rev = rev; }
    var cur = take(props, 'currency'); if (cur) { evt.cur = cur; }
    var pids = take(props, 'product_ids'); if (pids) { evt.pids = pids; }
    var pnames = take(props, 'product_names'); if (pnames) { evt.pnames = pnames; }
    var qty = take(props, 'quantity'); if (qty !== null) { evt.qty = qty; }
    var rest = 0;
    for (var key in props) { rest++; }
    if (rest) { evt.p = props; }
    enqueue(evt);
  }

  function identify(ids) {
    ids = ids || {};
    var body = JSON.stringify({
      token: TOKEN,
      aid: anonymousId(),
      email: ids.email || null,
      phone: ids.phone || null,
      cid: ids.customer_id || ids.cid || null
    });
    post(ENDPOINT + '/t/identify', body, false);
  }

  function helper(name) {
    return function (props) {
      props = props || {};
      if (!props.category) { props.category = 'ecommerce'; }
      track(name, props);
    };
  }

  function pageView() { track('PageView', {}); }

  var pushState = history.pushState;
  history.pushState = function () {
    pushState.apply(this, arguments);
    pageView();
  };
  var replaceState = history.replaceState;
  history.replaceState = function () {
    replaceState.apply(this, arguments);
    pageView();
  };
  window.addEventListener('popstate', pageView);

  document.addEventListener('visibilitychange', function () {
    if (document.visibilityState === 'hidden') { flush(true); }
  });
  window.addEventListener('pagehide', function () { flush(true); });

  window.opticdata = {
    track: track,
    identify: identify,
    viewContent: helper('ViewContent'),
    addToCart: helper('AddToCart'),
    initiateCheckout: helper('InitiateCheckout'),
    purchase: helper('Purchase'),
    lead: helper('Lead'),
    subscribe: helper('Subscribe')
  };

  pageView();
})();
";

/// Render the tag for a site. A verified custom domain becomes the event
/// endpoint base (first-party); otherwise events go to the dashboard host.
pub fn generate_pixel_script(
    site_token: &str,
    public_url: &str,
    verified_custom_domain: Option<&str>,
) -> String {
    let base = match verified_custom_domain {
        Some(domain) => format!("https://{}", domain.trim().trim_end_matches('.')),
        None => public_url.trim_end_matches('/').to_string(),
    };
    PIXEL_TEMPLATE
        .replace("__SITE_TOKEN__", site_token)
        .replace("__EVENT_BASE__", &base)
}

/// The copy-paste install snippet shown to site owners.
pub fn install_snippet(site_token: &str, public_url: &str) -> String {
    format!(
        "<script async src=\"{}/t/pixel.js?token={}\"></script>",
        public_url.trim_end_matches('/'),
        site_token
    )
}
