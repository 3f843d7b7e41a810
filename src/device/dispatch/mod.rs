pub mod provider;

pub mod router;
