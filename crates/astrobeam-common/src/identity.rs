//! Shareable session ids.
//!
//! An id is a zodiac name plus a four character base-36 suffix
//! (`leo-a4b8`). It only namespaces the relay; nothing in the protocol
//! depends on which sign was drawn.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::error::{Error, Result};

const SUFFIX_LEN: usize = 4;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZodiacSign {
    pub name: &'static str,
    pub symbol: &'static str,
    pub horoscopes: [&'static str; 2],
}

pub const ZODIAC_SIGNS: [ZodiacSign; 12] = [
    ZodiacSign {
        name: "Aries",
        symbol: "\u{2648}",
        horoscopes: [
            "A bold transfer is written in the stars for you.",
            "Your file will arrive with fiery speed.",
        ],
    },
    ZodiacSign {
        name: "Taurus",
        symbol: "\u{2649}",
        horoscopes: [
            "Patience ensures a successful data journey.",
            "A stable connection brings forth your files.",
        ],
    },
    ZodiacSign {
        name: "Gemini",
        symbol: "\u{264A}",
        horoscopes: [
            "A twin connection is imminent. Prepare for data doubling.",
            "Curiosity leads to a swift download.",
        ],
    },
    ZodiacSign {
        name: "Cancer",
        symbol: "\u{264B}",
        horoscopes: [
            "Nurture this connection, and your files will find their home.",
            "A secure and comforting transfer awaits.",
        ],
    },
    ZodiacSign {
        name: "Leo",
        symbol: "\u{264C}",
        horoscopes: [
            "A royally large file approaches your digital kingdom.",
            "Shine brightly, your transfer is the star of the show.",
        ],
    },
    ZodiacSign {
        name: "Virgo",
        symbol: "\u{264D}",
        horoscopes: [
            "Meticulous data packets align for a perfect transfer.",
            "An organized and efficient delivery is your destiny.",
        ],
    },
    ZodiacSign {
        name: "Libra",
        symbol: "\u{264E}",
        horoscopes: [
            "Balance is key. A harmonious connection will be achieved.",
            "A just and fair exchange of data is on the horizon.",
        ],
    },
    ZodiacSign {
        name: "Scorpio",
        symbol: "\u{264F}",
        horoscopes: [
            "A mysterious file from a powerful source will soon be yours.",
            "A deep and transformative data stream is flowing.",
        ],
    },
    ZodiacSign {
        name: "Sagittarius",
        symbol: "\u{2650}",
        horoscopes: [
            "Your files are on a grand adventure across the digital cosmos.",
            "An optimistic and expansive transfer is coming.",
        ],
    },
    ZodiacSign {
        name: "Capricorn",
        symbol: "\u{2651}",
        horoscopes: [
            "A disciplined and successful file transfer is guaranteed.",
            "Your ambition will be rewarded with a completed download.",
        ],
    },
    ZodiacSign {
        name: "Aquarius",
        symbol: "\u{2652}",
        horoscopes: [
            "An innovative connection method brings revolutionary data.",
            "Your files are riding on the waves of the future.",
        ],
    },
    ZodiacSign {
        name: "Pisces",
        symbol: "\u{2653}",
        horoscopes: [
            "Go with the flow; your data is swimming towards you.",
            "A dreamy and seamless transfer is about to manifest.",
        ],
    },
];

impl ZodiacSign {
    pub fn random_horoscope(&self) -> &'static str {
        self.horoscopes[rand::thread_rng().gen_range(0..self.horoscopes.len())]
    }
}

/// A freshly drawn session id and the sign it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub sign: ZodiacSign,
}

/// Draw a new session id. Collisions are not checked.
pub fn generate() -> SessionIdentity {
    let mut rng = rand::thread_rng();
    let sign = *ZODIAC_SIGNS
        .choose(&mut rng)
        .unwrap_or(&ZODIAC_SIGNS[0]);
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    SessionIdentity {
        session_id: format!("{}-{}", sign.name.to_ascii_lowercase(), suffix),
        sign,
    }
}

/// Trim and lower-case a user-entered code, then check its shape.
pub fn normalize_session_id(input: &str) -> Result<String> {
    let id = input.trim().to_ascii_lowercase();
    if is_valid_session_id(&id) {
        Ok(id)
    } else {
        Err(Error::invalid_session(format!(
            "'{}' is not a session code (expected e.g. leo-a4b8)",
            input.trim()
        )))
    }
}

/// `^[a-z]+-[0-9a-z]{4}$`
pub fn is_valid_session_id(id: &str) -> bool {
    let Some((word, suffix)) = id.split_once('-') else {
        return false;
    };
    !word.is_empty()
        && word.chars().all(|c| c.is_ascii_lowercase())
        && suffix.len() == SUFFIX_LEN
        && suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
}

/// Sign named by the id's prefix, if it is one of the twelve.
pub fn sign_for_session(session_id: &str) -> Option<ZodiacSign> {
    let prefix = session_id.split('-').next()?;
    ZODIAC_SIGNS
        .iter()
        .find(|sign| sign.name.eq_ignore_ascii_case(prefix))
        .copied()
}
