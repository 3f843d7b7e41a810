pub mod hsm;

#[cfg(test)]
pub mod mock;

pub mod softtoken;
