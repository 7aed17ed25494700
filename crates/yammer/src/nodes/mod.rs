//! Small producer/utility nodes: text input and templates.

pub mod template;
pub mod text_input;

pub use template::TemplateController;
pub use text_input::TextInput;
