use std::fmt::{self, Write as _};

use thiserror::Error;

/// Term syntax or placement error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TermError {
    /// Input ended before a term was found.
    #[error("empty term")]
    Empty,
    /// IRI is empty or contains a forbidden character.
    #[error("invalid IRI <{0}>")]
    InvalidIri(String),
    /// Blank node label is empty or contains a forbidden character.
    #[error("invalid blank node label _:{0}")]
    InvalidBlank(String),
    /// Language tag does not follow `[a-zA-Z]+(-[a-zA-Z0-9]+)*`.
    #[error("invalid language tag @{0}")]
    InvalidLanguage(String),
    /// Literal has both a language tag and a datatype.
    #[error("literal cannot carry both a language tag and a datatype")]
    ConflictingAnnotation,
    /// Literal is missing its closing quote.
    #[error("unterminated literal")]
    UnterminatedLiteral,
    /// Unknown or truncated escape sequence.
    #[error("invalid escape sequence in literal")]
    InvalidEscape,
    /// Term does not start with `<`, `_:` or `"`.
    #[error("unexpected character {0:?} at start of term")]
    UnexpectedStart(char),
    /// Extra input after a complete term or statement.
    #[error("unexpected trailing input {0:?}")]
    TrailingInput(String),
    /// Literal used as subject or non-IRI used as predicate.
    #[error("{term} cannot be used as {role}")]
    IllegalPosition {
        /// Canonical form of the offending term.
        term: String,
        /// Role it was placed in.
        role: &'static str,
    },
}

/// RDF term. `Display` renders the canonical N-Triples form, which is also
/// the form stored in dictionaries and journals.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    /// IRI without the angle brackets.
    Iri(String),
    /// Blank node label without the `_:` prefix.
    Blank(String),
    /// Literal with an optional language tag or datatype IRI.
    Literal {
        /// Unescaped lexical form.
        lexical: String,
        /// Language tag, lowercase.
        lang: Option<String>,
        /// Datatype IRI without brackets.
        datatype: Option<String>,
    },
}

impl Term {
    /// Builds a validated IRI term.
    pub fn iri(iri: impl Into<String>) -> Result<Self, TermError> {
        let iri = iri.into();
        validate_iri(&iri)?;
        Ok(Term::Iri(iri))
    }

    /// Builds a validated blank node.
    pub fn blank(label: impl Into<String>) -> Result<Self, TermError> {
        let label = label.into();
        validate_blank(&label)?;
        Ok(Term::Blank(label))
    }

    /// Builds a plain literal.
    pub fn literal(lexical: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            lang: None,
            datatype: None,
        }
    }

    /// Builds a language-tagged literal.
    pub fn lang_literal(lexical: impl Into<String>, lang: &str) -> Result<Self, TermError> {
        validate_lang(lang)?;
        Ok(Term::Literal {
            lexical: lexical.into(),
            lang: Some(lang.to_ascii_lowercase()),
            datatype: None,
        })
    }

    /// Builds a typed literal.
    pub fn typed_literal(
        lexical: impl Into<String>,
        datatype: impl Into<String>,
    ) -> Result<Self, TermError> {
        let datatype = datatype.into();
        validate_iri(&datatype)?;
        Ok(Term::Literal {
            lexical: lexical.into(),
            lang: None,
            datatype: Some(datatype),
        })
    }

    /// Parses exactly one canonical term.
    pub fn parse(input: &str) -> Result<Self, TermError> {
        let (term, rest) = parse_term_prefix(input.trim())?;
        if !rest.trim().is_empty() {
            return Err(TermError::TrailingInput(rest.trim().to_string()));
        }
        Ok(term)
    }

    /// Re-checks the syntax of a term that may have been built from the public
    /// variants directly.
    pub fn validate(&self) -> Result<(), TermError> {
        match self {
            Term::Iri(iri) => validate_iri(iri),
            Term::Blank(label) => validate_blank(label),
            Term::Literal { lang, datatype, .. } => {
                if lang.is_some() && datatype.is_some() {
                    return Err(TermError::ConflictingAnnotation);
                }
                if let Some(lang) = lang {
                    validate_lang(lang)?;
                }
                if let Some(datatype) = datatype {
                    validate_iri(datatype)?;
                }
                Ok(())
            }
        }
    }

    /// Returns true for literals.
    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal { .. })
    }

    /// Returns true for IRIs.
    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Blank(label) => write!(f, "_:{label}"),
            Term::Literal {
                lexical,
                lang,
                datatype,
            } => {
                f.write_char('"')?;
                for ch in lexical.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        other => f.write_char(other)?,
                    }
                }
                f.write_char('"')?;
                if let Some(lang) = lang {
                    write!(f, "@{lang}")?;
                } else if let Some(datatype) = datatype {
                    write!(f, "^^<{datatype}>")?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for Term {
    type Err = TermError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Term::parse(s)
    }
}

/// RDF statement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triple {
    /// Subject (IRI or blank node).
    pub subject: Term,
    /// Predicate (IRI).
    pub predicate: Term,
    /// Object (any term).
    pub object: Term,
}

impl Triple {
    /// Builds a triple, checking term syntax and positions.
    pub fn new(subject: Term, predicate: Term, object: Term) -> Result<Self, TermError> {
        let triple = Self {
            subject,
            predicate,
            object,
        };
        triple.validate()?;
        Ok(triple)
    }

    /// Checks term syntax and that literals are not subjects and predicates are IRIs.
    pub fn validate(&self) -> Result<(), TermError> {
        self.subject.validate()?;
        self.predicate.validate()?;
        self.object.validate()?;
        if self.subject.is_literal() {
            return Err(TermError::IllegalPosition {
                term: self.subject.to_string(),
                role: "subject",
            });
        }
        if !self.predicate.is_iri() {
            return Err(TermError::IllegalPosition {
                term: self.predicate.to_string(),
                role: "predicate",
            });
        }
        Ok(())
    }

    /// Parses one N-Triples statement: three terms followed by `.`.
    pub fn parse_line(line: &str) -> Result<Self, TermError> {
        let (subject, rest) = parse_term_prefix(line.trim_start())?;
        let (predicate, rest) = parse_term_prefix(rest.trim_start())?;
        let (object, rest) = parse_term_prefix(rest.trim_start())?;
        let rest = rest.trim_start();
        let Some(rest) = rest.strip_prefix('.') else {
            return Err(TermError::TrailingInput(rest.to_string()));
        };
        let rest = rest.trim();
        if !rest.is_empty() && !rest.starts_with('#') {
            return Err(TermError::TrailingInput(rest.to_string()));
        }
        Triple::new(subject, predicate, object)
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
    }
}

/// Triple pattern; `None` positions are wildcards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct TriplePattern {
    /// Bound subject.
    pub subject: Option<Term>,
    /// Bound predicate.
    pub predicate: Option<Term>,
    /// Bound object.
    pub object: Option<Term>,
}

impl TriplePattern {
    /// Builds a pattern from optional terms.
    pub fn new(subject: Option<Term>, predicate: Option<Term>, object: Option<Term>) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Pattern matching every triple.
    pub fn any() -> Self {
        Self::default()
    }

    /// Pattern matching exactly one triple.
    pub fn exact(triple: &Triple) -> Self {
        Self::new(
            Some(triple.subject.clone()),
            Some(triple.predicate.clone()),
            Some(triple.object.clone()),
        )
    }

    /// Checks the syntax of every bound term.
    pub fn validate(&self) -> Result<(), TermError> {
        for term in [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .flatten()
        {
            term.validate()?;
        }
        Ok(())
    }

    /// Returns true when `triple` satisfies every bound position.
    pub fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_ref().map_or(true, |t| *t == triple.subject)
            && self.predicate.as_ref().map_or(true, |t| *t == triple.predicate)
            && self.object.as_ref().map_or(true, |t| *t == triple.object)
    }
}

fn is_forbidden_iri_char(ch: char) -> bool {
    ch <= ' ' || matches!(ch, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\')
}

fn validate_iri(iri: &str) -> Result<(), TermError> {
    if iri.is_empty() || iri.chars().any(is_forbidden_iri_char) {
        return Err(TermError::InvalidIri(iri.to_string()));
    }
    Ok(())
}

fn is_blank_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

fn validate_blank(label: &str) -> Result<(), TermError> {
    if label.is_empty() || label.ends_with('.') || !label.chars().all(is_blank_char) {
        return Err(TermError::InvalidBlank(label.to_string()));
    }
    Ok(())
}

fn validate_lang(lang: &str) -> Result<(), TermError> {
    let mut parts = lang.split('-');
    let primary_ok = parts
        .next()
        .map_or(false, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphabetic()));
    let rest_ok = parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()));
    if primary_ok && rest_ok {
        Ok(())
    } else {
        Err(TermError::InvalidLanguage(lang.to_string()))
    }
}

/// Parses one term from the front of `input`, returning the unconsumed rest.
fn parse_term_prefix(input: &str) -> Result<(Term, &str), TermError> {
    let Some(first) = input.chars().next() else {
        return Err(TermError::Empty);
    };
    match first {
        '<' => {
            let (iri, rest) = parse_bracketed_iri(input)?;
            Ok((Term::Iri(iri), rest))
        }
        '_' => {
            let Some(body) = input.strip_prefix("_:") else {
                return Err(TermError::UnexpectedStart(first));
            };
            let mut end = body
                .char_indices()
                .find(|(_, c)| !is_blank_char(*c))
                .map_or(body.len(), |(idx, _)| idx);
            // A trailing '.' terminates the statement, not the label.
            while end > 0 && body.as_bytes()[end - 1] == b'.' {
                end -= 1;
            }
            let label = &body[..end];
            validate_blank(label)?;
            Ok((Term::Blank(label.to_string()), &body[end..]))
        }
        '"' => parse_literal(input),
        other => Err(TermError::UnexpectedStart(other)),
    }
}

fn parse_bracketed_iri(input: &str) -> Result<(String, &str), TermError> {
    let body = &input[1..];
    let Some(end) = body.find('>') else {
        return Err(TermError::InvalidIri(body.to_string()));
    };
    let iri = &body[..end];
    validate_iri(iri)?;
    Ok((iri.to_string(), &body[end + 1..]))
}

fn parse_literal(input: &str) -> Result<(Term, &str), TermError> {
    let body = &input[1..];
    let mut lexical = String::new();
    let mut chars = body.char_indices();
    let close = loop {
        let Some((idx, ch)) = chars.next() else {
            return Err(TermError::UnterminatedLiteral);
        };
        match ch {
            '"' => break idx,
            '\\' => {
                let Some((_, esc)) = chars.next() else {
                    return Err(TermError::InvalidEscape);
                };
                match esc {
                    '"' => lexical.push('"'),
                    '\\' => lexical.push('\\'),
                    '\'' => lexical.push('\''),
                    'n' => lexical.push('\n'),
                    'r' => lexical.push('\r'),
                    't' => lexical.push('\t'),
                    'b' => lexical.push('\u{8}'),
                    'f' => lexical.push('\u{c}'),
                    'u' | 'U' => {
                        let width = if esc == 'u' { 4 } else { 8 };
                        let mut code = 0u32;
                        for _ in 0..width {
                            let digit = chars
                                .next()
                                .and_then(|(_, c)| c.to_digit(16))
                                .ok_or(TermError::InvalidEscape)?;
                            code = code * 16 + digit;
                        }
                        lexical.push(char::from_u32(code).ok_or(TermError::InvalidEscape)?);
                    }
                    _ => return Err(TermError::InvalidEscape),
                }
            }
            other => lexical.push(other),
        }
    };
    let rest = &body[close + 1..];
    if let Some(tag) = rest.strip_prefix('@') {
        let end = tag
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-'))
            .map_or(tag.len(), |(idx, _)| idx);
        let term = Term::lang_literal(lexical, &tag[..end])?;
        return Ok((term, &tag[end..]));
    }
    if let Some(typed) = rest.strip_prefix("^^") {
        if !typed.starts_with('<') {
            return Err(TermError::InvalidIri(typed.to_string()));
        }
        let (datatype, rest) = parse_bracketed_iri(typed)?;
        return Ok((
            Term::Literal {
                lexical,
                lang: None,
                datatype: Some(datatype),
            },
            rest,
        ));
    }
    Ok((Term::literal(lexical), rest))
}
