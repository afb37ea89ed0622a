//! Builtin operators. Each registers its config under its type name;
//! deserializing a pipeline config picks the implementation by `type`.

mod file;
mod generate;
mod json;
mod regex;
mod severity;
mod stdout;
mod time;
