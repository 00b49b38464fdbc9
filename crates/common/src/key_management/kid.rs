//! Key identifier allocation.

use rand::Rng;

use crate::naming::{KeyFamily, Kid};

/// Length of the random part of a kid.
pub const KID_TOKEN_LEN: usize = 18;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Allocates a kid of the form `<family>__<18 base36 chars>`.
///
/// The store is not consulted: 18 base36 characters carry about 93 bits of
/// entropy, and a collision is accepted as negligible.
#[must_use]
pub fn allocate_kid(family: KeyFamily) -> Kid {
    let mut rng = rand::thread_rng();
    let token: String = (0..KID_TOKEN_LEN)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();

    Kid::from_parts(family, &token)
}
