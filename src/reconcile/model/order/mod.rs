pub mod exchange_order;
