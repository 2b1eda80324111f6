use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Boolean(bool),
    String(String),
    Integer(i64),
    Decimal(Decimal),
    Date(String),
    DateTime(String),
    Time(String),
    Quantity { value: Decimal, unit: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Multiply,
    Divide,
    IntegerDivide,
    Modulo,
    Add,
    Subtract,
    Concatenate,
    Union,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    In,
    Contains,
    And,
    Or,
    Xor,
    Implies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOperator {
    Is,
    As,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Literal(Literal),
    /// `{}`
    Empty,
    Identifier(String),
    /// `%name`
    Constant(String),
    This,
    Index,
    Total,
    Member {
        target: Box<ExpressionNode>,
        name: String,
    },
    Function {
        target: Option<Box<ExpressionNode>>,
        name: String,
        args: Vec<ExpressionNode>,
    },
    Indexer {
        target: Box<ExpressionNode>,
        index: Box<ExpressionNode>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<ExpressionNode>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<ExpressionNode>,
        right: Box<ExpressionNode>,
    },
    Type {
        op: TypeOperator,
        operand: Box<ExpressionNode>,
        type_name: String,
    },
}
