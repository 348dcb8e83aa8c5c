// src/parameters/handlers.rs
//! Built-in parameter handlers

use crate::parameters::{ParameterHandler, ParseContext, Token};
use crate::query::{Condition, Flag, QuerySession};
use crate::record::EventType;
use crate::utils::errors::ParameterError;
use chrono::{DateTime, Duration, Utc};

fn required_values(token: &Token, what: &str) -> Result<Vec<String>, ParameterError> {
    let values = token.values();
    if values.is_empty() {
        return Err(token.reject(format!("expected one or more {}", what)));
    }
    Ok(values)
}

/// `a:` / `action:` / `event:`: event types
pub struct EventHandler;

impl ParameterHandler for EventHandler {
    fn name(&self) -> &'static str {
        "action"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "a" | "action" | "event")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        let events = required_values(token, "event names")?
            .iter()
            .map(|value| value.parse::<EventType>().map_err(|reason| token.reject(reason)))
            .collect::<Result<Vec<_>, _>>()?;
        session.add_condition(Condition::Events(events));
        Ok(())
    }
}

/// `p:` / `player:`: player names or ids
pub struct PlayerHandler;

impl ParameterHandler for PlayerHandler {
    fn name(&self) -> &'static str {
        "player"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "p" | "player")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        let players = required_values(token, "player names")?;
        session.add_condition(Condition::Players(players));
        Ok(())
    }
}

/// `r:` / `radius:`: distance around the requester
pub struct RadiusHandler;

impl ParameterHandler for RadiusHandler {
    fn name(&self) -> &'static str {
        "radius"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "r" | "radius")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        ctx: &ParseContext,
    ) -> Result<(), ParameterError> {
        let radius: u32 = token
            .value
            .parse()
            .map_err(|_| token.reject("radius must be a whole number"))?;
        let center = session
            .requester()
            .location
            .clone()
            .ok_or_else(|| token.reject("radius needs a requester location"))?;

        let radius = radius.min(ctx.max_radius);
        session.add_condition(Condition::within(center, f64::from(radius)));
        Ok(())
    }
}

/// `w:` / `world:`
pub struct WorldHandler;

impl ParameterHandler for WorldHandler {
    fn name(&self) -> &'static str {
        "world"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "w" | "world")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        if token.value.is_empty() {
            return Err(token.reject("expected a world name"));
        }
        session.add_condition(Condition::World(token.value.clone()));
        Ok(())
    }
}

/// `b:` / `block:` / `target:`: block or entity types
pub struct TargetHandler;

impl ParameterHandler for TargetHandler {
    fn name(&self) -> &'static str {
        "target"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "b" | "block" | "target")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        let targets = required_values(token, "targets")?;
        session.add_condition(Condition::Targets(targets));
        Ok(())
    }
}

/// `t:` / `since:`: records no older than the duration
pub struct SinceHandler;

impl ParameterHandler for SinceHandler {
    fn name(&self) -> &'static str {
        "since"
    }

    fn handles(&self, name: &str) -> bool {
        matches!(name, "t" | "since")
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        ctx: &ParseContext,
    ) -> Result<(), ParameterError> {
        let cutoff = cutoff(token, ctx)?;
        session.add_condition(Condition::since(cutoff));
        Ok(())
    }
}

/// `before:`: records older than the duration
pub struct BeforeHandler;

impl ParameterHandler for BeforeHandler {
    fn name(&self) -> &'static str {
        "before"
    }

    fn handles(&self, name: &str) -> bool {
        name == "before"
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        ctx: &ParseContext,
    ) -> Result<(), ParameterError> {
        let cutoff = cutoff(token, ctx)?;
        session.add_condition(Condition::before(cutoff));
        Ok(())
    }
}

/// `-nogroup`, `-preview` and friends
pub struct FlagHandler;

impl FlagHandler {
    fn flag(name: &str) -> Option<Flag> {
        match name {
            "-nogroup" | "-no-group" => Some(Flag::NoGroup),
            "-preview" | "-dryrun" | "-dry-run" => Some(Flag::DryRun),
            _ => None,
        }
    }
}

impl ParameterHandler for FlagHandler {
    fn name(&self) -> &'static str {
        "flag"
    }

    fn handles(&self, name: &str) -> bool {
        Self::flag(name).is_some()
    }

    fn parse(
        &self,
        token: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        let flag = Self::flag(&token.name).ok_or_else(|| token.reject("unknown flag"))?;
        session.add_flag(flag);
        Ok(())
    }
}

/// `or`: following conditions form a new group
pub struct OrHandler;

impl ParameterHandler for OrHandler {
    fn name(&self) -> &'static str {
        "or"
    }

    fn handles(&self, name: &str) -> bool {
        name == "or"
    }

    fn parse(
        &self,
        _: &Token,
        session: &mut QuerySession,
        _: &ParseContext,
    ) -> Result<(), ParameterError> {
        session.new_group();
        Ok(())
    }
}

/// `now` minus the token's duration
fn cutoff(token: &Token, ctx: &ParseContext) -> Result<DateTime<Utc>, ParameterError> {
    let ago = parse_duration(&token.value).map_err(|reason| token.reject(reason))?;
    ctx.now
        .checked_sub_signed(ago)
        .ok_or_else(|| token.reject("duration reaches before the earliest representable time"))
}

/// Parse `1d2h30m` style durations. Units: s, m, h, d, w.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err("expected a duration such as 2h or 1d12h".to_string());
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let unit: i64 = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            other => return Err(format!("unknown time unit `{}`", other)),
        };
        if digits.is_empty() {
            return Err(format!("missing amount before `{}`", c));
        }
        let amount: i64 = digits
            .parse()
            .map_err(|_| format!("amount `{}` is too large", digits))?;
        total = amount
            .checked_mul(unit)
            .and_then(|seconds| total.checked_add(seconds))
            .ok_or_else(|| "duration is too large".to_string())?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("missing unit after `{}`", digits));
    }
    Duration::try_seconds(total).ok_or_else(|| "duration is too large".to_string())
}
