//! Critical-path CSS extraction: document and asset resolution, stylesheet
//! rebasing, and multi-viewport orchestration.

pub mod assemble;
pub mod config;
pub mod css_engine;
pub mod document;
pub mod fetch;
pub mod generate;
pub mod html;
pub mod images;
pub mod orchestrator;
pub mod path;
pub mod rebase;
pub mod renderer;
pub mod scope;
pub mod stylesheet;
pub mod types;

pub use assemble::{combine, ResultAssembler};
pub use config::{coerce, coerce_into, InlineOptions, Options, ReplaceStylesheets, Targets, FIELD_COERCIONS};
pub use css_engine::{AtRuleKind, IgnoreRules, Matcher};
pub use document::DocumentLoader;
pub use fetch::{AssetFetcher, Credentials, RequestOptions};
pub use generate::Critical;
pub use html::{InlineStrategy, LinkAction};
pub use orchestrator::{CriticalOrchestrator, RenderSettings, Rendered};
pub use path::Resolver;
pub use rebase::RebasePolicy;
pub use renderer::chromium::ChromiumRenderer;
pub use renderer::{CriticalRenderer, RenderError, RenderRequest};
pub use scope::ResourceScope;
pub use stylesheet::StylesheetResolver;
pub use types::*;
