// zodiac.rs - Sign catalogue and canonical ordering
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The twelve signs, declared in canonical (calendar) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Aries,
    Taurus,
    Gemini,
    Cancer,
    Leo,
    Virgo,
    Libra,
    Scorpio,
    Sagittarius,
    Capricorn,
    Aquarius,
    Pisces,
}

impl Sign {
    pub const ALL: [Sign; 12] = [
        Sign::Aries,
        Sign::Taurus,
        Sign::Gemini,
        Sign::Cancer,
        Sign::Leo,
        Sign::Virgo,
        Sign::Libra,
        Sign::Scorpio,
        Sign::Sagittarius,
        Sign::Capricorn,
        Sign::Aquarius,
        Sign::Pisces,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sign::Aries => "aries",
            Sign::Taurus => "taurus",
            Sign::Gemini => "gemini",
            Sign::Cancer => "cancer",
            Sign::Leo => "leo",
            Sign::Virgo => "virgo",
            Sign::Libra => "libra",
            Sign::Scorpio => "scorpio",
            Sign::Sagittarius => "sagittarius",
            Sign::Capricorn => "capricorn",
            Sign::Aquarius => "aquarius",
            Sign::Pisces => "pisces",
        }
    }

    /// Name shown in the title overlay (the channel publishes in French)
    pub fn display_name(&self) -> &'static str {
        match self {
            Sign::Aries => "Bélier",
            Sign::Taurus => "Taureau",
            Sign::Gemini => "Gémeaux",
            Sign::Cancer => "Cancer",
            Sign::Leo => "Lion",
            Sign::Virgo => "Vierge",
            Sign::Libra => "Balance",
            Sign::Scorpio => "Scorpion",
            Sign::Sagittarius => "Sagittaire",
            Sign::Capricorn => "Capricorne",
            Sign::Aquarius => "Verseau",
            Sign::Pisces => "Poissons",
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            Sign::Aries => "♈",
            Sign::Taurus => "♉",
            Sign::Gemini => "♊",
            Sign::Cancer => "♋",
            Sign::Leo => "♌",
            Sign::Virgo => "♍",
            Sign::Libra => "♎",
            Sign::Scorpio => "♏",
            Sign::Sagittarius => "♐",
            Sign::Capricorn => "♑",
            Sign::Aquarius => "♒",
            Sign::Pisces => "♓",
        }
    }

    /// Position in the canonical order (0-based)
    pub fn position(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sign {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Sign::ALL
            .iter()
            .copied()
            .find(|sign| sign.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown sign '{}'. Valid signs: {}",
                    s,
                    Sign::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                )
            })
    }
}
