pub mod call;
pub mod connect;
pub mod gateway;
pub mod identity;
