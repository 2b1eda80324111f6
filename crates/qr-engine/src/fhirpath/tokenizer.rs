//! FHIRPath lexer. Keywords come out as plain identifiers; the parser decides
//! from position whether `and`, `contains`, `div`, ... are operators or names.

use std::str::FromStr;

use rust_decimal::Decimal;

use super::error::{ExpressionError, ExpressionResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier { name: String, delimited: bool },
    String(String),
    Integer(i64),
    Decimal(Decimal),
    Date(String),
    DateTime(String),
    Time(String),
    /// `%name`, `` %`name` `` or `%'name'`
    Constant(String),
    This,
    Index,
    Total,
    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Pipe,
    Ampersand,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Token {
    /// Undelimited identifier text, used for keyword checks.
    pub fn keyword(&self) -> Option<&str> {
        match self {
            Token::Identifier {
                name,
                delimited: false,
            } => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Tokenizer<'input> {
    source: &'input str,
    chars: Vec<(usize, char)>,
    cursor: usize,
}

impl<'input> Tokenizer<'input> {
    pub fn new(source: &'input str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            cursor: 0,
        }
    }

    pub fn tokenize(mut self) -> ExpressionResult<Vec<Spanned>> {
        let mut tokens = Vec::new();
        while let Some(spanned) = self.next_token()? {
            tokens.push(spanned);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.cursor).map(|(_, ch)| *ch)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.cursor + offset).map(|(_, ch)| *ch)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.cursor)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.cursor += 1;
        }
        ch
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> String {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            text.push(ch);
            self.cursor += 1;
        }
        text
    }

    fn skip_trivia(&mut self) -> ExpressionResult<()> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(ch), _) if ch.is_whitespace() => {
                    self.cursor += 1;
                }
                (Some('/'), Some('/')) => {
                    self.take_while(|ch| ch != '\n');
                }
                (Some('/'), Some('*')) => {
                    let start = self.offset();
                    self.cursor += 2;
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.cursor += 2;
                                break;
                            }
                            (Some(_), _) => self.cursor += 1,
                            (None, _) => {
                                return Err(ExpressionError::syntax(
                                    "unterminated comment",
                                    start,
                                ));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> ExpressionResult<Option<Spanned>> {
        self.skip_trivia()?;
        let position = self.offset();
        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        let token = match ch {
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LeftParen),
            ')' => self.single(Token::RightParen),
            '[' => self.single(Token::LeftBracket),
            ']' => self.single(Token::RightBracket),
            '{' => self.single(Token::LeftBrace),
            '}' => self.single(Token::RightBrace),
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '*' => self.single(Token::Star),
            '/' => self.single(Token::Slash),
            '|' => self.single(Token::Pipe),
            '&' => self.single(Token::Ampersand),
            '=' => self.single(Token::Equal),
            '~' => self.single(Token::Equivalent),
            '!' => {
                self.cursor += 1;
                match self.bump() {
                    Some('=') => Token::NotEqual,
                    Some('~') => Token::NotEquivalent,
                    _ => return Err(ExpressionError::syntax("expected '=' or '~' after '!'", position)),
                }
            }
            '<' => {
                self.cursor += 1;
                if self.peek() == Some('=') {
                    self.cursor += 1;
                    Token::LessOrEqual
                } else {
                    Token::Less
                }
            }
            '>' => {
                self.cursor += 1;
                if self.peek() == Some('=') {
                    self.cursor += 1;
                    Token::GreaterOrEqual
                } else {
                    Token::Greater
                }
            }
            '\'' => {
                self.cursor += 1;
                Token::String(self.quoted('\'', position)?)
            }
            '`' => {
                self.cursor += 1;
                Token::Identifier {
                    name: self.quoted('`', position)?,
                    delimited: true,
                }
            }
            '%' => {
                self.cursor += 1;
                match self.peek() {
                    Some('`') => {
                        self.cursor += 1;
                        Token::Constant(self.quoted('`', position)?)
                    }
                    Some('\'') => {
                        self.cursor += 1;
                        Token::Constant(self.quoted('\'', position)?)
                    }
                    Some(ch) if is_identifier_start(ch) => {
                        Token::Constant(self.take_while(is_identifier_part))
                    }
                    _ => return Err(ExpressionError::syntax("expected name after '%'", position)),
                }
            }
            '$' => {
                self.cursor += 1;
                match self.take_while(is_identifier_part).as_str() {
                    "this" => Token::This,
                    "index" => Token::Index,
                    "total" => Token::Total,
                    other => {
                        return Err(ExpressionError::syntax(
                            format!("unknown special variable ${other}"),
                            position,
                        ));
                    }
                }
            }
            '@' => {
                self.cursor += 1;
                self.temporal(position)?
            }
            ch if ch.is_ascii_digit() => self.number(position)?,
            ch if is_identifier_start(ch) => Token::Identifier {
                name: self.take_while(is_identifier_part),
                delimited: false,
            },
            other => {
                return Err(ExpressionError::syntax(
                    format!("unexpected character '{other}'"),
                    position,
                ));
            }
        };

        Ok(Some(Spanned { token, position }))
    }

    fn single(&mut self, token: Token) -> Token {
        self.cursor += 1;
        token
    }

    fn quoted(&mut self, delimiter: char, start: usize) -> ExpressionResult<String> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(ExpressionError::syntax("unterminated literal", start)),
                Some(ch) if ch == delimiter => return Ok(text),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('r') => '\r',
                        Some('t') => '\t',
                        Some('f') => '\u{000C}',
                        Some('u') => {
                            let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                            u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| {
                                    ExpressionError::syntax("invalid unicode escape", start)
                                })?
                        }
                        Some(other) => other,
                        None => return Err(ExpressionError::syntax("unterminated literal", start)),
                    };
                    text.push(escaped);
                }
                Some(ch) => text.push(ch),
            }
        }
    }

    fn number(&mut self, position: usize) -> ExpressionResult<Token> {
        let mut text = self.take_while(|ch| ch.is_ascii_digit());
        let is_decimal = self.peek() == Some('.')
            && self.peek_at(1).is_some_and(|ch| ch.is_ascii_digit());
        if is_decimal {
            self.cursor += 1;
            text.push('.');
            text.push_str(&self.take_while(|ch| ch.is_ascii_digit()));
            Decimal::from_str(&text)
                .map(Token::Decimal)
                .map_err(|err| ExpressionError::syntax(format!("invalid decimal: {err}"), position))
        } else {
            text.parse::<i64>()
                .map(Token::Integer)
                .map_err(|err| ExpressionError::syntax(format!("invalid integer: {err}"), position))
        }
    }

    fn temporal(&mut self, position: usize) -> ExpressionResult<Token> {
        if self.peek() == Some('T') {
            self.cursor += 1;
            let time = self.take_while(|ch| ch.is_ascii_digit() || ch == ':' || ch == '.');
            if time.is_empty() {
                return Err(ExpressionError::syntax("empty time literal", position));
            }
            return Ok(Token::Time(time));
        }
        let date = self.take_while(|ch| ch.is_ascii_digit() || ch == '-');
        if date.is_empty() {
            return Err(ExpressionError::syntax("empty date literal", position));
        }
        if self.peek() == Some('T') {
            self.cursor += 1;
            let time = self.take_while(|ch| {
                ch.is_ascii_digit() || matches!(ch, ':' | '.' | '+' | '-' | 'Z')
            });
            if time.is_empty() {
                return Ok(Token::DateTime(date));
            }
            return Ok(Token::DateTime(format!("{date}T{time}")));
        }
        Ok(Token::Date(date))
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Tokenizer::new(source)
            .tokenize()
            .expect("tokenize")
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn lexes_paths_and_constants() {
        assert_eq!(
            tokens("%resource.item.where(linkId = 'a')"),
            vec![
                Token::Constant("resource".into()),
                Token::Dot,
                Token::Identifier {
                    name: "item".into(),
                    delimited: false
                },
                Token::Dot,
                Token::Identifier {
                    name: "where".into(),
                    delimited: false
                },
                Token::LeftParen,
                Token::Identifier {
                    name: "linkId".into(),
                    delimited: false
                },
                Token::Equal,
                Token::String("a".into()),
                Token::RightParen,
            ]
        );
    }

    #[test]
    fn lexes_numbers_dates_and_comments() {
        assert_eq!(
            tokens("1.5 // trailing\n@2024-02-01T10:00:00Z /* block */ @T08:30 7"),
            vec![
                Token::Decimal(Decimal::new(15, 1)),
                Token::DateTime("2024-02-01T10:00:00Z".into()),
                Token::Time("08:30".into()),
                Token::Integer(7),
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        let error = Tokenizer::new("'open").tokenize().unwrap_err();
        assert!(matches!(error, ExpressionError::Syntax { position: 0, .. }));
    }
}
