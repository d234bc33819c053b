pub mod neso;
pub mod prod_db;
