mod module;
pub use self::module::{ModuleKey, ModuleToken, Pkcs11Module, SlotId, SlotInfo};

mod driver;
pub use self::driver::HsmDriver;

#[cfg(test)]
pub use self::driver::tests::FakeModule;

#[cfg(feature = "hsm")]
mod library;
#[cfg(feature = "hsm")]
pub use self::library::CryptokiModule;
