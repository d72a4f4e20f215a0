//! Embeddable worker runtime.
//!
//! Runs ES module workers (`export default { fetch(request, env, ctx) }`) on
//! V8 with the Web Platform globals workers expect: `fetch`, streams,
//! `URL`, `Headers`/`Request`/`Response`, WebCrypto and `HTMLRewriter`.
//!
//! ```no_run
//! use edgeworker::{Engine, EngineConfig, Env, HttpRequest};
//!
//! let engine = Engine::new(EngineConfig::from_env())?;
//! engine.compile_and_cache(
//!     "hello",
//!     "v1",
//!     "export default { fetch() { return new Response('hi'); } }",
//! )?;
//! let result = engine.execute_fetch("hello", "v1", Env::new(), HttpRequest::get("https://example.com/"));
//! assert_eq!(result.response.map(|r| r.text()), Some("hi".to_string()));
//! # Ok::<(), edgeworker::EngineError>(())
//! ```

pub mod bindings;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod ops;
pub mod request_state;
pub mod result;
pub mod rewriter;
pub mod site;

pub use bindings::{binding, BindingContext, BindingValue, CustomBinding};
pub use config::{EngineConfig, FetchPolicy, HeaderRule};
pub use engine::initialize_v8;
pub use error::{EngineError, ErrorKind, WorkerError};
pub use event_loop::CancelToken;
pub use result::{HttpRequest, HttpResponse, LogEntry, LogLevel, WorkerResult};
pub use site::{Engine, EngineStats, Env};
