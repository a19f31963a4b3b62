pub mod loyalty_program;
pub mod loyalty_transaction;
pub mod menu_item;
pub mod order;
pub mod order_item;
pub mod payment;
