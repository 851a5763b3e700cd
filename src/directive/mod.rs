//! 指令层：数据模型、Markdown 格式、带版本的存储

pub mod format;
pub mod model;
pub mod store;

pub use model::{
    DeclaredInput, Directive, EdgeCase, Lesson, LessonKind, OperatorApproval, Revision,
    RevisionKind,
};
pub use store::DirectiveStore;
