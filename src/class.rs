//! Product classes: a time window plus feedtype/identifier selectors.

use log::warn;
use regex::Regex;

use crate::product::ProductInfo;
use crate::timestamp::Timestamp;
use crate::{Error, Result};

pub mod feedtype {
    pub const NONE: u32 = 0;
    pub const ANY: u32 = u32::MAX;
}

/// Parses a feedtype: decimal, `0x` hex, `ANY`, or `NONE`.
pub fn parse_feedtype(text: &str) -> Result<u32> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("any") {
        return Ok(feedtype::ANY);
    }
    if text.eq_ignore_ascii_case("none") {
        return Ok(feedtype::NONE);
    }
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| Error::Invalid("feedtype"))
}

const MATCH_ALL: &str = ".*";

/// One feedtype mask and identifier pattern.
#[derive(Debug, Clone)]
pub struct ProductSpec {
    pub feedtype: u32,
    pattern: String,
    regex: Option<Regex>,
}

impl ProductSpec {
    pub fn new(feedtype: u32, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = if pattern == MATCH_ALL {
            None
        } else {
            match Regex::new(&pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("bad product pattern {pattern:?}: {err}");
                    return Err(Error::Invalid("product-class pattern"));
                }
            }
        };
        Ok(Self {
            feedtype,
            pattern,
            regex,
        })
    }

    pub fn any() -> Self {
        Self {
            feedtype: feedtype::ANY,
            pattern: MATCH_ALL.to_string(),
            regex: None,
        }
    }

    /// Identifier pattern as given; compiled once at construction.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, info: &ProductInfo) -> bool {
        if self.feedtype & info.feedtype == 0 {
            return false;
        }
        match &self.regex {
            None => true,
            Some(regex) => regex.is_match(&info.ident),
        }
    }
}

/// Products inside `[from, to]` (either order) matching any spec.
#[derive(Debug, Clone)]
pub struct ProductClass {
    pub from: Timestamp,
    pub to: Timestamp,
    pub specs: Vec<ProductSpec>,
}

impl ProductClass {
    pub fn new(from: Timestamp, to: Timestamp, specs: Vec<ProductSpec>) -> Self {
        Self { from, to, specs }
    }

    /// Every product, all time.
    pub fn all() -> Self {
        Self::new(Timestamp::ZERO, Timestamp::ENDT, vec![ProductSpec::any()])
    }

    pub fn is_all(&self) -> bool {
        self.from == Timestamp::ZERO
            && self.to == Timestamp::ENDT
            && self
                .specs
                .iter()
                .any(|spec| spec.feedtype == feedtype::ANY && spec.regex.is_none())
    }

    /// Whether `time` lies in the window. A reversed window selects the
    /// same span.
    pub fn time_in_class(&self, time: Timestamp) -> bool {
        if self.from > self.to {
            !(time < self.to || time > self.from)
        } else {
            !(time < self.from || time > self.to)
        }
    }

    pub fn matches(&self, info: &ProductInfo) -> bool {
        if self.is_all() {
            return true;
        }
        if !self.time_in_class(info.arrival) {
            return false;
        }
        self.specs.iter().any(|spec| spec.matches(info))
    }
}
