//! Domain types shared by the engine, executor and adapters.

mod context;
mod response;
mod rule;

pub use context::{parse_query_string, MatchContext};
pub use response::MockResponse;
pub use rule::{
    MatchCondition, MatchType, MethodMatch, Protocol, RegexCondition, ResponseContent,
    ResponseSpec, ResponseType, Rule, RuleValidationError, ScriptCondition, SimpleCondition,
};
