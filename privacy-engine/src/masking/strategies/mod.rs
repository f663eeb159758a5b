//! Built-in masking strategies.

mod aes;
mod hash;
mod hmac;
mod null;
mod random_string;
mod string_rewrite;

pub use aes::{AesEncryptConfig, AesEncryptStrategy, AesMode};
pub use hash::{DigestAlgorithm, HashConfig, HashStrategy};
pub use self::hmac::{HmacConfig, HmacStrategy};
pub use null::NullRewriteStrategy;
pub use random_string::{RandomStringRewriteConfig, RandomStringRewriteStrategy};
pub use string_rewrite::{StringRewriteConfig, StringRewriteStrategy};
