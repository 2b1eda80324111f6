pub mod extensions;
pub mod questionnaire;

pub use extensions::BoundSource;
pub use questionnaire::{
    AnswerOption, Element, EnableBehavior, EnableWhen, EnableWhenOperator, Extension, Initial,
    Item, ItemType, Questionnaire,
};
