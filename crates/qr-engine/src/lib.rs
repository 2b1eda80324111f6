#![allow(missing_docs)]

pub mod codec;
pub mod config;
pub mod datatypes;
pub mod engine;
pub mod error;
pub mod expr;
pub mod fhirpath;
pub mod locator;
pub mod path_index;
pub mod quantity;
pub mod render;
pub mod response;
pub mod scope;
pub mod spec;
pub mod tree;
pub mod validate;
pub mod valueset;
pub mod visibility;

pub use config::EngineConfig;
pub use datatypes::{AnswerValue, Attachment, Coding, Expression, Quantity, Reference};
pub use engine::{FormEngine, OptionsRequest, OptionsState, OptionsTicket, SubscriptionId};
pub use error::{StructuralError, StructuralResult};
pub use expr::{ExpressionPurpose, ExpressionSlot, SlotError};
pub use fhirpath::{Collection, ErrorKind, ExpressionError, FhirPathValue};
pub use locator::{LocateError, Selector, locate, locate_at, locate_or_create};
pub use path_index::{PathIndex, PathSegment};
pub use render::{
    RenderNode, RenderPayload, RenderProgress, RenderStatus, build_render_payload, render_json_ui,
    render_text,
};
pub use response::{Answer, QuestionnaireResponse, ResponseItem};
pub use scope::{DuplicateVariable, ScopeId, ScopeTree};
pub use spec::{Item, ItemType, Questionnaire};
pub use tree::{Node, NodeId, NodeKind, NodeTree};
pub use validate::{Issue, IssueCode, IssueOwner, Severity, ValidationReport, validate};
pub use valueset::{
    ExpansionCache, ExpansionError, LocalExpansionTable, TerminologyServerExpander,
    ValueSetExpander, load_options,
};
pub use visibility::VisibilityMode;
