pub mod anon;
pub mod health;
