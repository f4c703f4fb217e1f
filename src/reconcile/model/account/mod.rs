pub mod exchange_account;
