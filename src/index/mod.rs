pub mod definition;
pub mod table;
pub mod engine;
pub mod worker;
