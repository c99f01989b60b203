use std::collections::HashSet;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::{ops, str::FromStr};

use serde::{Deserialize, Serialize};

/// Longest topic accepted, in bytes.
pub const MAX_TOPIC_LEN: usize = 255;

#[inline]
fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("empty topic")]
    Empty,
    #[error("topic too long, {0} bytes")]
    TooLong(usize),
    #[error("topic contains a NUL character")]
    NulChar,
    #[error("too many topic levels, {0}")]
    TooManyLevels(usize),
    #[error("wildcards are not allowed in `{0}`")]
    WildcardNotAllowed(String),
    #[error("invalid level `{0}`")]
    InvalidLevel(String),
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS, only as the first level
    Blank,
    SingleWildcard, // +
    MultiWildcard,  // #
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(*self, Level::Metadata(_))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    fn parse_at(s: &str, pos: usize) -> Result<Level, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(s.into()))
                } else if pos == 0 && is_metadata(s) {
                    Ok(Level::Metadata(s.into()))
                } else {
                    Ok(Level::Normal(s.into()))
                }
            }
        }
    }
}

/// A parsed topic name or topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(|l| l.is_wildcard())
    }

    /// Validates and parses a topic string.
    ///
    /// Rejects the empty string, more than 255 bytes, NUL, more than `max_levels`
    /// levels, a level mixing a wildcard with other characters, a `#` that is not
    /// the last level and, when `allow_wildcards` is false, any wildcard.
    pub fn validate(s: &str, allow_wildcards: bool, max_levels: usize) -> Result<Topic, TopicError> {
        if s.is_empty() {
            return Err(TopicError::Empty);
        }
        if s.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong(s.len()));
        }
        if s.contains('\0') {
            return Err(TopicError::NulChar);
        }
        let levels = s.split('/').count();
        if max_levels > 0 && levels > max_levels {
            return Err(TopicError::TooManyLevels(levels));
        }
        let topic = Topic::from_str(s)?;
        if !allow_wildcards && topic.has_wildcard() {
            return Err(TopicError::WildcardNotAllowed(s.into()));
        }
        Ok(topic)
    }

    /// Does this filter match the concrete topic name?
    ///
    /// Names starting with `$` are not matched by a wildcard in the first level.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let topic = topic.as_ref();
        let mut segs = topic.split('/');
        for (pos, level) in self.0.iter().enumerate() {
            match level {
                Level::MultiWildcard => return !(pos == 0 && is_metadata(topic)),
                Level::SingleWildcard => match segs.next() {
                    Some(s) if !(pos == 0 && is_metadata(s)) => continue,
                    _ => return false,
                },
                Level::Blank => match segs.next() {
                    Some("") => continue,
                    _ => return false,
                },
                Level::Normal(l) | Level::Metadata(l) => match segs.next() {
                    Some(s) if s == l => continue,
                    _ => return false,
                },
            }
        }
        segs.next().is_none()
    }

    /// Does every topic matched by `filter` also match this pattern?
    pub fn covers(&self, filter: &Topic) -> bool {
        for (pos, level) in self.0.iter().enumerate() {
            let other = filter.0.get(pos);
            match level {
                Level::MultiWildcard => {
                    return !(pos == 0 && matches!(other, Some(Level::Metadata(_))));
                }
                Level::SingleWildcard => match other {
                    None | Some(Level::MultiWildcard) => return false,
                    Some(Level::Metadata(_)) if pos == 0 => return false,
                    _ => continue,
                },
                _ => match other {
                    Some(l) if l == level => continue,
                    _ => return false,
                },
            }
        }
        filter.0.len() == self.0.len()
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        Level::parse_at(s, 0)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        let levels = s
            .split('/')
            .enumerate()
            .map(|(pos, l)| Level::parse_at(l, pos))
            .collect::<Result<Vec<_>, TopicError>>()?;
        if levels.iter().take(levels.len().saturating_sub(1)).any(|l| *l == Level::MultiWildcard) {
            return Err(TopicError::InvalidTopic(s.into()));
        }
        Ok(Topic(levels))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if first {
                first = false;
            } else {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! topic {
    ($s:expr) => {
        $s.parse::<$crate::topic::Topic>()
    };
}

/// Reserved first-level prefixes that split traffic into isolated namespaces.
#[derive(Clone, Debug, Default)]
pub struct Namespaces {
    prefixes: Arc<HashSet<String>>,
}

impl Namespaces {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { prefixes: Arc::new(prefixes.into_iter().map(Into::into).collect()) }
    }

    /// Splits on the first `/`. A reserved prefix yields `(Some(prefix), remainder)`,
    /// anything else belongs to the catch-all namespace and is returned whole.
    #[inline]
    pub fn split<'a>(&self, topic: &'a str) -> (Option<&'a str>, &'a str) {
        let (prefix, rest) = topic.split_once('/').unwrap_or((topic, ""));
        if self.prefixes.contains(prefix) {
            (Some(prefix), rest)
        } else {
            (None, topic)
        }
    }

    #[inline]
    pub fn is_system(&self, topic: &str) -> bool {
        self.split(topic).0.is_some()
    }

    #[inline]
    pub fn prefixes(&self) -> impl Iterator<Item = &String> {
        self.prefixes.iter()
    }
}
