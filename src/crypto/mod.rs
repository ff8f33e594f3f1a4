pub mod callback;
pub mod secret;

pub use callback::{CallbackCrypto, CallbackError, CallbackMessage};
pub use secret::{CryptoError, SecretCipher};
