//! Pratt parser for FHIRPath.

use super::ast::{BinaryOperator, ExpressionNode, Literal, TypeOperator, UnaryOperator};
use super::error::{ExpressionError, ExpressionResult};
use super::tokenizer::{Spanned, Token, Tokenizer};

/// Binding power, loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Implies,
    Or,
    And,
    Membership,
    Equality,
    Inequality,
    Union,
    Type,
    Additive,
    Multiplicative,
    Unary,
}

const CALENDAR_UNITS: &[&str] = &[
    "year",
    "years",
    "month",
    "months",
    "week",
    "weeks",
    "day",
    "days",
    "hour",
    "hours",
    "minute",
    "minutes",
    "second",
    "seconds",
    "millisecond",
    "milliseconds",
];

pub fn parse(source: &str) -> ExpressionResult<ExpressionNode> {
    let tokens = Tokenizer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        end: source.len(),
    };
    if parser.tokens.is_empty() {
        return Err(ExpressionError::syntax("empty expression", 0));
    }
    let expression = parser.expression(Precedence::Lowest)?;
    if let Some(extra) = parser.tokens.get(parser.cursor) {
        return Err(ExpressionError::syntax(
            format!("unexpected trailing {:?}", extra.token),
            extra.position,
        ));
    }
    Ok(expression)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|spanned| &spanned.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|spanned| spanned.position)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|spanned| spanned.token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> ExpressionResult<()> {
        let position = self.position();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(other) => Err(ExpressionError::syntax(
                format!("expected {what}, found {other:?}"),
                position,
            )),
            None => Err(ExpressionError::syntax(
                format!("expected {what}, found end of input"),
                position,
            )),
        }
    }

    fn infix_operator(&self) -> Option<(Precedence, BinaryOperator)> {
        let token = self.peek()?;
        let operator = match token {
            Token::Star => (Precedence::Multiplicative, BinaryOperator::Multiply),
            Token::Slash => (Precedence::Multiplicative, BinaryOperator::Divide),
            Token::Plus => (Precedence::Additive, BinaryOperator::Add),
            Token::Minus => (Precedence::Additive, BinaryOperator::Subtract),
            Token::Ampersand => (Precedence::Additive, BinaryOperator::Concatenate),
            Token::Pipe => (Precedence::Union, BinaryOperator::Union),
            Token::Less => (Precedence::Inequality, BinaryOperator::Less),
            Token::LessOrEqual => (Precedence::Inequality, BinaryOperator::LessOrEqual),
            Token::Greater => (Precedence::Inequality, BinaryOperator::Greater),
            Token::GreaterOrEqual => (Precedence::Inequality, BinaryOperator::GreaterOrEqual),
            Token::Equal => (Precedence::Equality, BinaryOperator::Equal),
            Token::NotEqual => (Precedence::Equality, BinaryOperator::NotEqual),
            Token::Equivalent => (Precedence::Equality, BinaryOperator::Equivalent),
            Token::NotEquivalent => (Precedence::Equality, BinaryOperator::NotEquivalent),
            other => match other.keyword()? {
                "div" => (Precedence::Multiplicative, BinaryOperator::IntegerDivide),
                "mod" => (Precedence::Multiplicative, BinaryOperator::Modulo),
                "in" => (Precedence::Membership, BinaryOperator::In),
                "contains" => (Precedence::Membership, BinaryOperator::Contains),
                "and" => (Precedence::And, BinaryOperator::And),
                "or" => (Precedence::Or, BinaryOperator::Or),
                "xor" => (Precedence::Or, BinaryOperator::Xor),
                "implies" => (Precedence::Implies, BinaryOperator::Implies),
                _ => return None,
            },
        };
        Some(operator)
    }

    fn type_operator(&self) -> Option<TypeOperator> {
        match self.peek()?.keyword()? {
            "is" => Some(TypeOperator::Is),
            "as" => Some(TypeOperator::As),
            _ => None,
        }
    }

    fn expression(&mut self, min: Precedence) -> ExpressionResult<ExpressionNode> {
        let mut left = self.prefix()?;
        loop {
            left = self.postfix(left)?;

            if let Some(op) = self.type_operator() {
                if Precedence::Type <= min {
                    break;
                }
                self.cursor += 1;
                let type_name = self.type_name()?;
                left = ExpressionNode::Type {
                    op,
                    operand: Box::new(left),
                    type_name,
                };
                continue;
            }

            let Some((precedence, op)) = self.infix_operator() else {
                break;
            };
            let right_associative = op == BinaryOperator::Implies;
            if precedence < min || (precedence == min && !right_associative) {
                break;
            }
            self.cursor += 1;
            let right = if right_associative {
                self.expression(Precedence::Or)?
            } else {
                self.expression(precedence)?
            };
            left = ExpressionNode::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn prefix(&mut self) -> ExpressionResult<ExpressionNode> {
        let position = self.position();
        let Some(token) = self.advance() else {
            return Err(ExpressionError::syntax("unexpected end of input", position));
        };
        let node = match token {
            Token::String(text) => ExpressionNode::Literal(Literal::String(text)),
            Token::Integer(value) => match self.unit()? {
                Some(unit) => ExpressionNode::Literal(Literal::Quantity {
                    value: value.into(),
                    unit,
                }),
                None => ExpressionNode::Literal(Literal::Integer(value)),
            },
            Token::Decimal(value) => match self.unit()? {
                Some(unit) => ExpressionNode::Literal(Literal::Quantity { value, unit }),
                None => ExpressionNode::Literal(Literal::Decimal(value)),
            },
            Token::Date(text) => ExpressionNode::Literal(Literal::Date(text)),
            Token::DateTime(text) => ExpressionNode::Literal(Literal::DateTime(text)),
            Token::Time(text) => ExpressionNode::Literal(Literal::Time(text)),
            Token::Constant(name) => ExpressionNode::Constant(name),
            Token::This => ExpressionNode::This,
            Token::Index => ExpressionNode::Index,
            Token::Total => ExpressionNode::Total,
            Token::LeftParen => {
                let inner = self.expression(Precedence::Lowest)?;
                self.expect(Token::RightParen, "')'")?;
                inner
            }
            Token::LeftBrace => {
                self.expect(Token::RightBrace, "'}'")?;
                ExpressionNode::Empty
            }
            Token::Plus | Token::Minus => {
                let op = if token == Token::Minus {
                    UnaryOperator::Minus
                } else {
                    UnaryOperator::Plus
                };
                let operand = self.expression(Precedence::Unary)?;
                ExpressionNode::Unary {
                    op,
                    operand: Box::new(operand),
                }
            }
            Token::Identifier { name, delimited } => {
                if !delimited && (name == "true" || name == "false") {
                    ExpressionNode::Literal(Literal::Boolean(name == "true"))
                } else if self.peek() == Some(&Token::LeftParen) {
                    let args = self.arguments()?;
                    ExpressionNode::Function {
                        target: None,
                        name,
                        args,
                    }
                } else {
                    ExpressionNode::Identifier(name)
                }
            }
            other => {
                return Err(ExpressionError::syntax(
                    format!("unexpected {other:?}"),
                    position,
                ));
            }
        };
        Ok(node)
    }

    /// Member access, function invocation and indexing bind tighter than anything.
    fn postfix(&mut self, mut node: ExpressionNode) -> ExpressionResult<ExpressionNode> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.cursor += 1;
                    let position = self.position();
                    let name = match self.advance() {
                        Some(Token::Identifier { name, .. }) => name,
                        other => {
                            return Err(ExpressionError::syntax(
                                format!("expected a name after '.', found {other:?}"),
                                position,
                            ));
                        }
                    };
                    node = if self.peek() == Some(&Token::LeftParen) {
                        ExpressionNode::Function {
                            target: Some(Box::new(node)),
                            name,
                            args: self.arguments()?,
                        }
                    } else {
                        ExpressionNode::Member {
                            target: Box::new(node),
                            name,
                        }
                    };
                }
                Some(Token::LeftBracket) => {
                    self.cursor += 1;
                    let index = self.expression(Precedence::Lowest)?;
                    self.expect(Token::RightBracket, "']'")?;
                    node = ExpressionNode::Indexer {
                        target: Box::new(node),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(node),
            }
        }
    }

    fn arguments(&mut self) -> ExpressionResult<Vec<ExpressionNode>> {
        self.expect(Token::LeftParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RightParen) {
            self.cursor += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression(Precedence::Lowest)?);
            let position = self.position();
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RightParen) => return Ok(args),
                other => {
                    return Err(ExpressionError::syntax(
                        format!("expected ',' or ')', found {other:?}"),
                        position,
                    ));
                }
            }
        }
    }

    /// Optional unit after a number literal: a quoted UCUM code or a calendar word.
    fn unit(&mut self) -> ExpressionResult<Option<String>> {
        match self.peek() {
            Some(Token::String(unit)) => {
                let unit = unit.clone();
                self.cursor += 1;
                Ok(Some(unit))
            }
            Some(token) => match token.keyword() {
                Some(word) if CALENDAR_UNITS.contains(&word) => {
                    let unit = word.to_string();
                    self.cursor += 1;
                    Ok(Some(unit))
                }
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Possibly qualified type specifier such as `Coding` or `System.String`.
    fn type_name(&mut self) -> ExpressionResult<String> {
        let position = self.position();
        let mut name = match self.advance() {
            Some(Token::Identifier { name, .. }) => name,
            other => {
                return Err(ExpressionError::syntax(
                    format!("expected a type name, found {other:?}"),
                    position,
                ));
            }
        };
        while self.peek() == Some(&Token::Dot) {
            if let Some(Spanned {
                token: Token::Identifier { name: part, .. },
                ..
            }) = self.tokens.get(self.cursor + 1)
            {
                name.push('.');
                name.push_str(part);
                self.cursor += 2;
            } else {
                break;
            }
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_multiplication_tighter_than_addition() {
        let node = parse("1 + 2 * 3").expect("parse");
        let ExpressionNode::Binary { op, right, .. } = node else {
            panic!("expected binary node");
        };
        assert_eq!(op, BinaryOperator::Add);
        assert!(matches!(
            *right,
            ExpressionNode::Binary {
                op: BinaryOperator::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn unary_minus_binds_tighter_than_multiplication() {
        let node = parse("-2 * 3").expect("parse");
        let ExpressionNode::Binary { op, left, .. } = node else {
            panic!("expected binary node");
        };
        assert_eq!(op, BinaryOperator::Multiply);
        assert!(matches!(
            *left,
            ExpressionNode::Unary {
                op: UnaryOperator::Minus,
                ..
            }
        ));
    }

    #[test]
    fn parses_invocation_chain_with_quantity() {
        let node = parse("%weight.value > 5 'kg'").expect("parse");
        let ExpressionNode::Binary { op, left, right } = node else {
            panic!("expected comparison");
        };
        assert_eq!(op, BinaryOperator::Greater);
        assert!(matches!(*left, ExpressionNode::Member { .. }));
        assert!(matches!(
            *right,
            ExpressionNode::Literal(Literal::Quantity { .. })
        ));
    }

    #[test]
    fn contains_is_a_function_after_dot_and_an_operator_otherwise() {
        assert!(matches!(
            parse("name.contains('x')").expect("parse"),
            ExpressionNode::Function { .. }
        ));
        assert!(matches!(
            parse("names contains 'x'").expect("parse"),
            ExpressionNode::Binary {
                op: BinaryOperator::Contains,
                ..
            }
        ));
    }

    #[test]
    fn reports_position_of_trailing_garbage() {
        let error = parse("a.b )").unwrap_err();
        assert_eq!(
            error,
            ExpressionError::Syntax {
                message: "unexpected trailing RightParen".into(),
                position: 4,
            }
        );
    }
}
