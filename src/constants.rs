//! Various signer-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `secsigner` binary.
pub const SIGNER_APP: &str = "Security Server Signer";


//------------ Config Files Paths -------------------------------------------

/// The default path to the signer config file.
pub const SIGNER_DEFAULT_CONFIG_FILE: &str = "/etc/secsigner.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const SIGNER_ENV_LOG_LEVEL: &str = "SECSIGNER_LOG_LEVEL";

/// The environment variable with the data directory.
pub const SIGNER_ENV_DATA_DIR: &str = "SECSIGNER_DATA_DIR";


//------------ Data Directory Layout ----------------------------------------

/// The file holding the persisted token registry.
pub const SNAPSHOT_FILE: &str = "tokens.json";

/// The advisory lock file guarding the snapshot.
pub const SNAPSHOT_LOCK_FILE: &str = "tokens.lock";

/// The current version of the snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The directory under the data dir used by the software keystore.
pub const SOFT_TOKEN_DIR: &str = "softtoken";

/// The directory under the software keystore dir holding key files.
pub const SOFT_TOKEN_KEYS_DIR: &str = "keys";

/// The file holding the software keystore PIN verifier.
pub const SOFT_TOKEN_PIN_FILE: &str = "pin.json";

/// The extension of software keystore key files.
pub const SOFT_TOKEN_KEY_EXT: &str = "p8.json";

/// The extension of key files re-encrypted under a new PIN that are not
/// yet moved into place.
pub const SOFT_TOKEN_STAGED_KEY_EXT: &str = "p8.json.new";


//------------ Tokens -------------------------------------------------------

/// The identifier of the one and only software token.
pub const SOFT_TOKEN_ID: &str = "0";

/// The device kind label of the software keystore.
pub const SOFT_TOKEN_KIND: &str = "softToken";

/// The friendly name given to the software token when first seen.
pub const SOFT_TOKEN_DEFAULT_NAME: &str = "softToken-0";

/// RSA modulus size used for generated key pairs.
pub const KEY_SIZE_BITS: u32 = 2048;

/// The number of random bytes used for a hardware key id (CKA_ID).
pub const HSM_KEY_ID_LEN: usize = 20;


//------------ Requests -----------------------------------------------------

/// The maximum length of any identifier, label or name in a request.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// The size of the request queue in front of the workers.
pub const REQUEST_QUEUE_SIZE: usize = 256;
