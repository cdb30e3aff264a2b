//! Initial passwords for stand users

use rand::Rng;

pub const DEFAULT_PASSWORD_LENGTH: usize = 8;

/// `len` random decimal digits
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
