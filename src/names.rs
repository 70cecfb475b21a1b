//! Generated exit-node names such as `peaceful-turing4`.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "admiring", "agitated", "amazing", "bold", "brave", "busy", "charming", "clever", "cool",
    "dazzling", "determined", "eager", "ecstatic", "elastic", "epic", "festive", "focused",
    "friendly", "gallant", "gifted", "goofy", "gracious", "happy", "hopeful", "hungry", "jolly",
    "keen", "kind", "laughing", "loving", "lucid", "magical", "modest", "nice", "nifty",
    "nostalgic", "optimistic", "peaceful", "practical", "quirky", "relaxed", "serene", "sharp",
    "stoic", "sweet", "tender", "trusting", "upbeat", "vibrant", "vigilant", "wizardly", "zen",
];

const SURNAMES: &[&str] = &[
    "albattani", "allen", "archimedes", "babbage", "bardeen", "bell", "blackwell", "boyd",
    "cannon", "curie", "darwin", "dijkstra", "einstein", "elion", "euclid", "euler", "fermat",
    "franklin", "galileo", "goldberg", "hamilton", "hawking", "heisenberg", "hopper", "hypatia",
    "jackson", "johnson", "kare", "keller", "knuth", "lamarr", "lovelace", "mayer", "mcclintock",
    "meitner", "morse", "newton", "noether", "pascal", "ritchie", "shannon", "sinoussi", "tesla",
    "thompson", "torvalds", "turing", "wilson", "wozniak", "wright", "yonath",
];

/// Returns a random `adjective-surnameN` name valid as a hostname on every
/// supported provider.
#[must_use]
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("eager");
    let surname = SURNAMES.choose(&mut rng).copied().unwrap_or("turing");
    let suffix: u8 = rng.gen_range(0..10);
    format!("{adjective}-{surname}{suffix}")
}
