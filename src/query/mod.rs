pub mod builder;
pub mod compiler;
pub mod escape;
pub mod highlighter;
pub mod parser;
pub mod solr;

pub use builder::{BuiltQuery, QueryBuilder};
pub use compiler::QueryCompiler;
pub use escape::{escape_query, escape_value};
pub use highlighter::Highlighter;
pub use parser::{parse_query, QueryNode};
