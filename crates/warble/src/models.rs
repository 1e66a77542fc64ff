//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - request bodies sent from the interface to the server
//! - turn events streamed from the agent to the interface
//! - openai compatible messages/tools, sent from the agent to the LLM
//! - capability calls, sent from the agent to the capabilities
//!
//! We always immediately convert those data models into the internal structs
//! using to/from helpers, so the internal models are not an exact match to any
//! of these formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
