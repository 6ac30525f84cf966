//! Symbol Canonicalization
//!
//! Clients may subscribe to a domestic instrument under its bare six-digit
//! code (`005930`) or under an exchange-suffixed alias (`005930.KS`,
//! `005930.KQ`). The upstream feed only knows the bare code. Every component
//! that needs to translate between the two goes through [`canonicalize`].

use std::fmt;

/// Korean exchange identified by a symbol suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// KOSPI main board (`.KS`).
    Kospi,
    /// KOSDAQ (`.KQ`).
    Kosdaq,
}

impl Exchange {
    /// All exchanges a bare code may be listed under.
    pub const ALL: [Self; 2] = [Self::Kospi, Self::Kosdaq];

    /// Suffix used by clients, including the leading dot.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Kospi => ".KS",
            Self::Kosdaq => ".KQ",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        if suffix.eq_ignore_ascii_case("KS") {
            Some(Self::Kospi)
        } else if suffix.eq_ignore_ascii_case("KQ") {
            Some(Self::Kosdaq)
        } else {
            None
        }
    }
}

/// A symbol reduced to its upstream code plus the exchange it was spelled with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalSymbol {
    code: String,
    exchange: Option<Exchange>,
    domestic: bool,
}

impl CanonicalSymbol {
    /// The bare code (`005930`), or the trimmed symbol for foreign tickers.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Exchange suffix the symbol was written with, if any.
    #[must_use]
    pub const fn exchange(&self) -> Option<Exchange> {
        self.exchange
    }

    /// Whether this is a six-digit domestic code the upstream feed can push.
    #[must_use]
    pub const fn is_domestic(&self) -> bool {
        self.domestic
    }

    /// Code to subscribe on the upstream feed, `None` for foreign tickers.
    #[must_use]
    pub fn upstream_code(&self) -> Option<&str> {
        self.domestic.then_some(self.code.as_str())
    }

    /// Every subscription key that must receive a tick for this symbol.
    ///
    /// Domestic codes fan out under the bare code and both exchange suffixes,
    /// since the feed does not say which board an instrument trades on.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        if !self.domestic {
            return vec![self.code.clone()];
        }

        let mut aliases = Vec::with_capacity(1 + Exchange::ALL.len());
        aliases.push(self.code.clone());
        aliases.extend(
            Exchange::ALL
                .iter()
                .map(|exchange| format!("{}{}", self.code, exchange.suffix())),
        );
        aliases
    }
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exchange {
            Some(exchange) => write!(f, "{}{}", self.code, exchange.suffix()),
            None => f.write_str(&self.code),
        }
    }
}

/// Canonicalize a client- or feed-supplied symbol.
#[must_use]
pub fn canonicalize(symbol: &str) -> CanonicalSymbol {
    let trimmed = symbol.trim();

    let (base, exchange) = match trimmed.rsplit_once('.') {
        Some((base, suffix)) => match Exchange::from_suffix(suffix) {
            Some(exchange) => (base, Some(exchange)),
            None => (trimmed, None),
        },
        None => (trimmed, None),
    };

    let domestic = is_domestic_code(base);

    CanonicalSymbol {
        code: if domestic {
            base.to_string()
        } else {
            trimmed.to_string()
        },
        exchange: exchange.filter(|_| domestic),
        domestic,
    }
}

fn is_domestic_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}
