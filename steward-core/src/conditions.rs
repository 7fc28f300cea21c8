use std::collections::BTreeMap;

use thiserror::Error;

use steward_types::Version;

/// Host facts evaluated by `installable_condition` predicates and
/// `conditional_items`. Collected once per session.
#[derive(Debug, Clone, Default)]
pub struct Facts {
    values: BTreeMap<String, FactValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl Facts {
    pub fn new() -> Facts {
        Facts::default()
    }

    /// Facts sampled from the running host.
    pub fn gather(os_version: &str, arch: &str, available_disk_kb: u64) -> Facts {
        let mut facts = Facts::new();
        facts.set_str("os_vers", os_version);
        facts.set_str("arch", arch);
        facts.set_number("available_disk_space", available_disk_kb as f64);
        if let Ok(name) = hostname::get() {
            facts.set_str("hostname", &name.to_string_lossy());
        }
        facts
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.values
            .insert(key.to_string(), FactValue::String(value.to_string()));
    }

    pub fn set_number(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), FactValue::Number(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), FactValue::Bool(value));
    }

    pub fn set_list(&mut self, key: &str, value: Vec<String>) {
        self.values.insert(key.to_string(), FactValue::List(value));
    }

    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.values.get(key)
    }

    pub fn os_version(&self) -> Version {
        match self.get("os_vers") {
            Some(FactValue::String(s)) => Version::new(s),
            _ => Version::new("0"),
        }
    }

    pub fn arch(&self) -> &str {
        match self.get("arch") {
            Some(FactValue::String(s)) => s,
            _ => "",
        }
    }

    pub fn available_disk_kb(&self) -> u64 {
        match self.get("available_disk_space") {
            Some(FactValue::Number(n)) => *n as u64,
            _ => u64::max_value(),
        }
    }

    /// Evaluates a predicate expression against these facts.
    pub fn evaluate(&self, predicate: &str) -> Result<bool, PredicateError> {
        let tokens = lex(predicate)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            facts: self,
        };
        let result = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(PredicateError::TrailingInput(predicate.to_string()));
        }
        Ok(result)
    }
}

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("Unterminated string literal in predicate")]
    UnterminatedString,

    #[error("Unexpected character `{0}` in predicate")]
    UnexpectedChar(char),

    #[error("Unexpected end of predicate")]
    UnexpectedEnd,

    #[error("Unexpected token `{0}`")]
    UnexpectedToken(String),

    #[error("Unknown fact `{0}`")]
    UnknownFact(String),

    #[error("Trailing input after predicate: {0}")]
    TrailingInput(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Op(Op),
    And,
    Or,
    Not,
    In,
    Contains,
    BeginsWith,
    True,
    False,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn lex(input: &str) -> Result<Vec<Token>, PredicateError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' | '\'' => {
                let quote = ch;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => s.push(c),
                        None => return Err(PredicateError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Op(Op::Eq));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(Op::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(Op::Le));
                } else {
                    tokens.push(Token::Op(Op::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(Op::Ge));
                } else {
                    tokens.push(Token::Op(Op::Gt));
                }
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = s.parse::<f64>().map_err(|_| {
                    PredicateError::UnexpectedToken(s.clone())
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    "IN" => tokens.push(Token::In),
                    "CONTAINS" => tokens.push(Token::Contains),
                    "BEGINSWITH" => tokens.push(Token::BeginsWith),
                    "TRUE" => tokens.push(Token::True),
                    "FALSE" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            c => return Err(PredicateError::UnexpectedChar(c)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    facts: &'a Facts,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token, PredicateError> {
        let token = self.tokens.get(self.pos).ok_or(PredicateError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<bool, PredicateError> {
        let mut value = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<bool, PredicateError> {
        let mut value = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<bool, PredicateError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(!self.parse_unary()?)
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let value = self.parse_or()?;
                match self.next()? {
                    Token::RParen => Ok(value),
                    other => Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
                }
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(true)
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(false)
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<bool, PredicateError> {
        let key = match self.next()? {
            Token::Ident(name) => name.clone(),
            other => return Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
        };

        let fact = self
            .facts
            .get(&key)
            .ok_or_else(|| PredicateError::UnknownFact(key.clone()))?
            .clone();

        match self.next()?.clone() {
            Token::Op(op) => {
                let rhs = self.next()?.clone();
                Ok(compare(&fact, op, &rhs)?)
            }
            Token::In => {
                // `key IN ("a", "b")` or string containment: `key IN "abc"`.
                match self.next()?.clone() {
                    Token::Str(s) => Ok(fact_as_string(&fact).map(|f| s.contains(&f)).unwrap_or(false)),
                    Token::LParen => {
                        let mut found = false;
                        loop {
                            match self.next()?.clone() {
                                Token::Str(s) => {
                                    if fact_as_string(&fact).as_deref() == Some(s.as_str()) {
                                        found = true;
                                    }
                                }
                                Token::Number(n) => {
                                    if let FactValue::Number(f) = &fact {
                                        if (f - n).abs() < f64::EPSILON {
                                            found = true;
                                        }
                                    }
                                }
                                Token::RParen => break,
                                _ => continue,
                            }
                        }
                        Ok(found)
                    }
                    other => Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
                }
            }
            Token::Contains => match self.next()?.clone() {
                Token::Str(s) => Ok(match &fact {
                    FactValue::String(f) => f.contains(&s),
                    FactValue::List(items) => items.iter().any(|item| item == &s),
                    _ => false,
                }),
                other => Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
            },
            Token::BeginsWith => match self.next()?.clone() {
                Token::Str(s) => Ok(fact_as_string(&fact)
                    .map(|f| f.starts_with(&s))
                    .unwrap_or(false)),
                other => Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
            },
            other => Err(PredicateError::UnexpectedToken(format!("{:?}", other))),
        }
    }
}

fn fact_as_string(fact: &FactValue) -> Option<String> {
    match fact {
        FactValue::String(s) => Some(s.clone()),
        FactValue::Number(n) => Some(n.to_string()),
        FactValue::Bool(b) => Some(b.to_string()),
        FactValue::List(_) => None,
    }
}

fn compare(fact: &FactValue, op: Op, rhs: &Token) -> Result<bool, PredicateError> {
    use std::cmp::Ordering;

    let ord = match (fact, rhs) {
        (FactValue::Number(f), Token::Number(n)) => {
            f.partial_cmp(n).unwrap_or(Ordering::Equal)
        }
        (FactValue::Bool(b), Token::True) => b.cmp(&true),
        (FactValue::Bool(b), Token::False) => b.cmp(&false),
        // Version-style keys compare as loose versions, so
        // `os_vers >= "10.15"` behaves as expected against "10.15.7".
        (FactValue::String(f), Token::Str(s)) => {
            if looks_like_version(f) && looks_like_version(s) {
                Version::new(f).cmp(&Version::new(s))
            } else {
                f.as_str().cmp(s.as_str())
            }
        }
        (FactValue::Number(f), Token::Str(s)) => {
            let f_str = f.to_string();
            f_str.cmp(s)
        }
        _ => {
            return Err(PredicateError::UnexpectedToken(format!("{:?}", rhs)));
        }
    };

    Ok(match op {
        Op::Eq => ord == Ordering::Equal,
        Op::Ne => ord != Ordering::Equal,
        Op::Lt => ord == Ordering::Less,
        Op::Le => ord != Ordering::Greater,
        Op::Gt => ord == Ordering::Greater,
        Op::Ge => ord != Ordering::Less,
    })
}

fn looks_like_version(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}
