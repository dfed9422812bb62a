pub mod jwt;
pub mod text;
