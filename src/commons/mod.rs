//! Common types used by the various signer components.
pub mod error;
pub mod util;


//------------ Response Aliases ----------------------------------------------

pub type SignerEmptyResult = std::result::Result<(), self::error::Error>;
pub type SignerResult<T> = std::result::Result<T, self::error::Error>;
