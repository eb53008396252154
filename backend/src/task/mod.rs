pub mod cost;
pub mod model;
pub mod repository;
pub mod repository_sqlx;
