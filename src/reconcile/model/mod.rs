pub mod account;
pub mod cursor;
pub mod order;
