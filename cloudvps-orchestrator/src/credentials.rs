use rand::seq::SliceRandom;
use rand::Rng;

pub const ROOT_PASSWORD_LENGTH: usize = 16;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*";

/// Root password for a new VM, drawn from the thread-local CSPRNG (OS seeded).
pub fn generate_root_password() -> String {
    generate_password(&mut rand::thread_rng(), ROOT_PASSWORD_LENGTH)
}

/// `len` characters containing at least one upper, lower, digit and symbol.
pub fn generate_password<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    let classes = [UPPER, LOWER, DIGITS, SYMBOLS];
    let alphabet: Vec<u8> = classes.concat();

    let mut out: Vec<u8> = classes
        .iter()
        .take(len)
        .filter_map(|class| class.choose(rng).copied())
        .collect();
    while out.len() < len {
        out.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    out.shuffle(rng);
    out.into_iter().map(char::from).collect()
}
