//! Documentation verification pipeline.
//!
//! | Module         | Responsibility                                              |
//! |----------------|-------------------------------------------------------------|
//! | `orchestrator` | job queue, stage runner, bounded fan-out, aggregation       |
//! | `fetch`        | cloning the repository under test                           |
//! | `extractor`    | turning documentation into an ordered use case list         |
//! | `executor`     | synthesizing, running and assessing one use case            |
//! | `agent`        | the coding agent seam and the `claude` CLI implementation   |
//! | `sandbox`      | isolated, ephemeral execution (docker or local process)     |
//! | `store`        | job persistence (in-memory or SQLite)                       |
//! | `api`, `ws`    | HTTP gateway and progress push channel                      |
//! | `server`       | wiring the production collaborators and serving the gateway |

pub mod agent;
pub mod api;
pub mod executor;
pub mod extractor;
pub mod fetch;
pub mod orchestrator;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
