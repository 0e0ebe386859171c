pub mod attribution;
pub mod domains;
pub mod health;
pub mod reports;
pub mod settings;
pub mod sites;
pub mod track;
