//! Controlled vocabularies and PII handling shared by the normalizers.
//!
//! Everything here is a pure function. Raw account and NI numbers never leave
//! this module unmasked; callers store the masked form plus a peppered hash.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MASK_GLYPH: char = '•';
pub const PEPPER_LEN: usize = 32;

const ACCOUNT_VISIBLE_DIGITS: usize = 4;
const NI_VISIBLE_CHARS: usize = 3;

const INSTITUTION_ALIASES: &[(&str, &str)] = &[
    ("MONZO", "Monzo"),
    ("MONZO BANK", "Monzo"),
    ("MONZO BANK LTD", "Monzo"),
    ("MONZO BANK LIMITED", "Monzo"),
    ("STARLING", "Starling"),
    ("STARLING BANK", "Starling"),
    ("STARLING BANK LIMITED", "Starling"),
    ("BARCLAYS", "Barclays"),
    ("BARCLAYS BANK PLC", "Barclays"),
    ("BARCLAYS BANK UK PLC", "Barclays"),
    ("HSBC", "HSBC"),
    ("HSBC UK", "HSBC"),
    ("HSBC UK BANK PLC", "HSBC"),
    ("LLOYDS", "Lloyds"),
    ("LLOYDS BANK", "Lloyds"),
    ("LLOYDS BANK PLC", "Lloyds"),
    ("NATWEST", "NatWest"),
    ("NATIONAL WESTMINSTER BANK PLC", "NatWest"),
    ("SANTANDER", "Santander"),
    ("SANTANDER UK PLC", "Santander"),
    ("NATIONWIDE", "Nationwide"),
    ("NATIONWIDE BUILDING SOCIETY", "Nationwide"),
    ("HALIFAX", "Halifax"),
    ("BANK OF SCOTLAND PLC", "Bank of Scotland"),
    ("TSB", "TSB"),
    ("TSB BANK PLC", "TSB"),
    ("FIRST DIRECT", "First Direct"),
    ("REVOLUT", "Revolut"),
    ("REVOLUT LTD", "Revolut"),
    ("THE CO-OPERATIVE BANK", "Co-operative Bank"),
    ("THE CO-OPERATIVE BANK PLC", "Co-operative Bank"),
    ("CHASE", "Chase"),
    ("JPMORGAN CHASE BANK, N.A.", "Chase"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionName {
    pub canonical: String,
    pub raw: String,
}

/// Maps a raw institution string onto its canonical display name. Unknown
/// institutions keep their trimmed spelling as the canonical value.
pub fn canonicalise_institution(name: &str) -> Option<InstitutionName> {
    let raw = name.trim();
    if raw.is_empty() {
        return None;
    }

    let canonical = INSTITUTION_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(raw))
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| raw.to_string());

    Some(InstitutionName {
        canonical,
        raw: raw.to_string(),
    })
}

pub fn canonicalise_employer(name: &str) -> Option<String> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Groceries,
    Dining,
    Transport,
    Utilities,
    Housing,
    Entertainment,
    Shopping,
    Health,
    Travel,
    Subscriptions,
    Income,
    Transfers,
    Savings,
    Investments,
    Fees,
    Cash,
    Misc,
}

impl Category {
    pub const ALL: [Category; 17] = [
        Category::Groceries,
        Category::Dining,
        Category::Transport,
        Category::Utilities,
        Category::Housing,
        Category::Entertainment,
        Category::Shopping,
        Category::Health,
        Category::Travel,
        Category::Subscriptions,
        Category::Income,
        Category::Transfers,
        Category::Savings,
        Category::Investments,
        Category::Fees,
        Category::Cash,
        Category::Misc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Groceries => "Groceries",
            Category::Dining => "Dining",
            Category::Transport => "Transport",
            Category::Utilities => "Utilities",
            Category::Housing => "Housing",
            Category::Entertainment => "Entertainment",
            Category::Shopping => "Shopping",
            Category::Health => "Health",
            Category::Travel => "Travel",
            Category::Subscriptions => "Subscriptions",
            Category::Income => "Income",
            Category::Transfers => "Transfers",
            Category::Savings => "Savings",
            Category::Investments => "Investments",
            Category::Fees => "Fees",
            Category::Cash => "Cash",
            Category::Misc => "Misc",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Never fails: anything outside the closed set lands in `Misc`.
pub fn normalise_category(input: &str) -> Category {
    let trimmed = input.trim();
    Category::ALL
        .into_iter()
        .find(|category| category.as_str().eq_ignore_ascii_case(trimmed))
        .unwrap_or(Category::Misc)
}

pub fn mask_account(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(|c| c.is_ascii_digit()).collect();
    mask_tail(&digits, ACCOUNT_VISIBLE_DIGITS)
}

pub fn mask_ni(value: &str) -> String {
    let chars: Vec<char> = value.trim().chars().collect();
    mask_tail(&chars, NI_VISIBLE_CHARS)
}

fn mask_tail(chars: &[char], visible: usize) -> String {
    let hidden = chars.len().saturating_sub(visible);
    chars
        .iter()
        .enumerate()
        .map(|(idx, c)| if idx < hidden { MASK_GLYPH } else { *c })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PepperError {
    #[error("pepper is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("pepper must decode to {PEPPER_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Secret key mixed into every PII hash.
#[derive(Clone, PartialEq, Eq)]
pub struct Pepper([u8; PEPPER_LEN]);

impl Pepper {
    pub fn from_base64(encoded: &str) -> Result<Self, PepperError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|err| PepperError::InvalidEncoding(err.to_string()))?;
        let key: [u8; PEPPER_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PepperError::InvalidLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; PEPPER_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Pepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pepper(*****)")
    }
}

/// SHA-256 over the trimmed value followed by the pepper, hex encoded.
pub fn hash_pii(value: &str, pepper: &Pepper) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(trimmed.as_bytes());
    hasher.update(pepper.0);
    hex::encode(hasher.finalize())
}
