pub mod ikev2;
pub mod logger;
