// src/parameters/mod.rs
//! Query parameter parsing
//!
//! Requesters describe what they want as whitespace separated tokens:
//!
//! ```text
//! p:alice a:block-break t:2h r:20 or w:nether -nogroup
//! └─────────── group 0 ─────────┘    └group 1┘ └ flag ┘
//! ```
//!
//! Each token is offered to the registered handlers in registration order;
//! the first one that claims the token name parses it into conditions on
//! the [`QuerySession`]. Unknown tokens are rejected before anything runs.

pub mod handlers;

pub use handlers::{
    parse_duration, BeforeHandler, EventHandler, FlagHandler, OrHandler, PlayerHandler,
    RadiusHandler, SinceHandler, TargetHandler, WorldHandler,
};

use crate::query::{Condition, QuerySession, Requester};
use crate::utils::config::QueryConfig;
use crate::utils::errors::ParameterError;
use chrono::{DateTime, Utc};
use tracing::debug;

/// One `name:value` token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Lower-cased name (the whole token when there is no `:`)
    pub name: String,

    /// Everything after the first `:`
    pub value: String,

    /// As typed
    pub raw: String,
}

impl Token {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (name, value) = raw.split_once(':').unwrap_or((raw, ""));
        Self {
            name: name.to_lowercase(),
            value: value.trim().to_string(),
            raw: raw.to_string(),
        }
    }

    /// Error for this token
    pub fn reject(&self, reason: impl Into<String>) -> ParameterError {
        ParameterError::new(&self.raw, reason)
    }

    /// Comma separated values, empty entries dropped
    pub fn values(&self) -> Vec<String> {
        self.value
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Inputs handlers need besides the token
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Reference point for relative times
    pub now: DateTime<Utc>,
    pub default_radius: u32,
    pub max_radius: u32,
}

impl ParseContext {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            now: Utc::now(),
            default_radius: config.default_radius,
            max_radius: config.max_radius,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Turns one kind of token into session conditions
pub trait ParameterHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this handler claims tokens with the given name
    fn handles(&self, name: &str) -> bool;

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        ctx: &ParseContext,
    ) -> Result<(), ParameterError>;
}

/// Ordered handler list; the first handler claiming a token wins
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn ParameterHandler>>,
}

impl HandlerRegistry {
    /// A registry with no handlers
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler; earlier handlers keep precedence
    pub fn register(&mut self, handler: Box<dyn ParameterHandler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_for(&self, name: &str) -> Option<&dyn ParameterHandler> {
        self.handlers
            .iter()
            .find(|handler| handler.handles(name))
            .map(|handler| handler.as_ref())
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// Parse every token into a fresh session.
    ///
    /// When the requester has a location, groups without any spatial
    /// condition are limited to the default radius around it.
    pub fn build_session<S: AsRef<str>>(
        &self,
        tokens: &[S],
        requester: Requester,
        ctx: &ParseContext,
    ) -> Result<QuerySession, ParameterError> {
        let mut session = QuerySession::new(requester);

        for raw in tokens {
            let token = Token::parse(raw.as_ref());
            if token.raw.is_empty() {
                continue;
            }
            let handler = self
                .handler_for(&token.name)
                .ok_or_else(|| token.reject("unknown parameter"))?;
            debug!("Parameter `{}` handled by {}", token.raw, handler.name());
            handler.parse(&token, &mut session, ctx)?;
        }

        apply_default_radius(&mut session, ctx);
        Ok(session)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Box::new(EventHandler))
            .register(Box::new(PlayerHandler))
            .register(Box::new(RadiusHandler))
            .register(Box::new(WorldHandler))
            .register(Box::new(TargetHandler))
            .register(Box::new(SinceHandler))
            .register(Box::new(BeforeHandler))
            .register(Box::new(FlagHandler))
            .register(Box::new(OrHandler));
        registry
    }
}

fn apply_default_radius(session: &mut QuerySession, ctx: &ParseContext) {
    let Some(center) = session.requester().location.clone() else {
        return;
    };
    let radius = f64::from(ctx.default_radius.min(ctx.max_radius));

    if session.effective_groups().next().is_none() {
        session.new_group().add(Condition::within(center, radius));
        return;
    }

    for group in session.groups_mut() {
        if !group.is_empty() && !group.has_spatial() {
            group.add(Condition::within(center.clone(), radius));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Flag;
    use crate::record::{EventType, Location};

    fn ctx() -> ParseContext {
        ParseContext::from_config(&QueryConfig::default())
    }

    #[test]
    fn test_token_parsing() {
        let token = Token::parse("B:minecraft:stone");
        assert_eq!(token.name, "b");
        assert_eq!(token.value, "minecraft:stone");

        let flag = Token::parse("-NoGroup");
        assert_eq!(flag.name, "-nogroup");
        assert!(flag.value.is_empty());

        assert_eq!(Token::parse("p:alice,,bob").values(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_unknown_token_rejected() {
        let registry = HandlerRegistry::default();
        let err = registry
            .build_session(&["p:alice", "colour:red"], Requester::console(), &ctx())
            .unwrap_err();
        assert_eq!(err.token, "colour:red");
    }

    #[test]
    fn test_or_splits_groups() {
        let registry = HandlerRegistry::default();
        let session = registry
            .build_session(
                &["p:alice", "a:block-break", "or", "w:nether", "-nogroup"],
                Requester::console(),
                &ctx(),
            )
            .unwrap();

        assert_eq!(session.groups().len(), 2);
        assert_eq!(
            session.groups()[0].conditions(),
            &[
                Condition::Players(vec!["alice".into()]),
                Condition::Events(vec![EventType::BlockBreak]),
            ]
        );
        assert_eq!(session.groups()[1].conditions(), &[Condition::World("nether".into())]);
        assert!(session.has_flag(Flag::NoGroup));
    }

    #[test]
    fn test_default_radius_only_where_unbounded() {
        let registry = HandlerRegistry::default();
        let here = Location::block("world", 0, 64, 0);
        let session = registry
            .build_session(
                &["p:alice", "or", "p:bob", "r:3"],
                Requester::new("mod").at(here.clone()),
                &ctx(),
            )
            .unwrap();

        let groups = session.groups();
        assert_eq!(
            groups[0].conditions().last(),
            Some(&Condition::within(here.clone(), f64::from(QueryConfig::default().default_radius)))
        );
        assert_eq!(groups[1].conditions().last(), Some(&Condition::within(here, 3.0)));
    }

    #[test]
    fn test_empty_tokens_near_requester() {
        let registry = HandlerRegistry::default();
        let here = Location::block("world", 5, 64, 5);
        let session = registry
            .build_session::<&str>(&[], Requester::new("mod").at(here), &ctx())
            .unwrap();
        assert_eq!(session.groups().len(), 1);
        assert!(session.groups()[0].has_spatial());

        let console = registry
            .build_session::<&str>(&[], Requester::console(), &ctx())
            .unwrap();
        assert!(console.groups().is_empty());
    }

    #[test]
    fn test_first_registered_handler_wins() {
        struct Shadow;

        impl ParameterHandler for Shadow {
            fn name(&self) -> &'static str {
                "shadow"
            }

            fn handles(&self, name: &str) -> bool {
                name == "p"
            }

            fn parse(
                &self,
                _: &Token,
                session: &mut QuerySession,
                _: &ParseContext,
            ) -> Result<(), ParameterError> {
                session.add_condition(Condition::player("shadowed"));
                Ok(())
            }
        }

        let mut registry = HandlerRegistry::empty();
        registry.register(Box::new(Shadow)).register(Box::new(PlayerHandler));
        assert_eq!(registry.handler_for("p").unwrap().name(), "shadow");
        assert_eq!(registry.handler_for("player").unwrap().name(), "player");
        assert_eq!(registry.handler_names(), vec!["shadow", "player"]);
    }
}
