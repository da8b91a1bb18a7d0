//! Compiled-program cache and the one backend dispatch point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{javascript, lua, template, Emission, Invocation, InvocationContext, StrategyError};
use crate::topics::{Strategy, StrategyLanguage};

/// Slack past the deadline before the blocking task is abandoned; the
/// VM-internal guards are expected to fire first.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone)]
enum CompiledProgram {
    Javascript { source: Arc<str> },
    Lua { source: Arc<str> },
    Template { tera: Arc<tera::Tera> },
}

struct CacheEntry {
    /// Strategy `updated_at` at compile time; a mismatch invalidates.
    version: chrono::DateTime<chrono::Utc>,
    program: Result<CompiledProgram, String>,
}

/// Compiles, caches, and invokes strategies.
///
/// Compile failures are cached too: every evaluation of a broken
/// strategy reports the same [`StrategyError::Compile`] until the
/// strategy is edited.
pub struct StrategyHost {
    cache: Mutex<HashMap<i64, CacheEntry>>,
    timeout: Duration,
}

impl StrategyHost {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Write-time validation for the management API.
    pub fn compile_check(language: StrategyLanguage, code: &str) -> Result<(), StrategyError> {
        match language {
            StrategyLanguage::Javascript => javascript::compile(code),
            StrategyLanguage::Lua => lua::compile(code),
            StrategyLanguage::Template => template::compile(code).map(|_| ()),
        }
        .map_err(StrategyError::Compile)
    }

    /// Drops the cached program for a deleted strategy.
    pub fn invalidate(&self, strategy_id: i64) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&strategy_id);
        }
    }

    /// Runs the strategy with the given context. Emissions come back with
    /// fully resolved target topic names.
    pub async fn invoke(
        &self,
        strategy: &Strategy,
        ctx: InvocationContext,
    ) -> Result<Invocation, StrategyError> {
        let program = self.compiled(strategy)?;
        let deadline = self.timeout;
        let topic = ctx.topic.clone();

        let raw = match program {
            CompiledProgram::Javascript { source } => {
                run_bounded(deadline, move || javascript::run(&source, &ctx)).await?
            }
            CompiledProgram::Lua { source } => {
                run_bounded(deadline, move || lua::run(&source, &ctx, deadline)).await?
            }
            CompiledProgram::Template { tera } => {
                run_bounded(deadline, move || template::run(&tera, &ctx)).await?
            }
        };

        let mut emissions = Vec::with_capacity(raw.emissions.len());
        for (subpath, value) in raw.emissions {
            emissions.push(Emission {
                target: resolve_target(&topic, subpath.as_deref())?,
                value,
            });
        }
        Ok(Invocation {
            emissions,
            logs: raw.logs,
        })
    }

    fn compiled(&self, strategy: &Strategy) -> Result<CompiledProgram, StrategyError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| StrategyError::Runtime("program cache poisoned".to_string()))?;

        if let Some(entry) = cache.get(&strategy.id) {
            if entry.version == strategy.updated_at {
                return entry
                    .program
                    .clone()
                    .map_err(StrategyError::Compile);
            }
        }

        debug!(
            "compiling strategy {} ('{}', {})",
            strategy.id, strategy.name, strategy.language
        );
        let program: Result<CompiledProgram, String> = match strategy.language {
            StrategyLanguage::Javascript => javascript::compile(&strategy.code).map(|_| {
                CompiledProgram::Javascript {
                    source: Arc::from(strategy.code.as_str()),
                }
            }),
            StrategyLanguage::Lua => lua::compile(&strategy.code).map(|_| CompiledProgram::Lua {
                source: Arc::from(strategy.code.as_str()),
            }),
            StrategyLanguage::Template => {
                template::compile(&strategy.code).map(|tera| CompiledProgram::Template {
                    tera: Arc::new(tera),
                })
            }
        };

        cache.insert(
            strategy.id,
            CacheEntry {
                version: strategy.updated_at,
                program: program.clone(),
            },
        );
        program.map_err(StrategyError::Compile)
    }
}

async fn run_bounded<F>(deadline: Duration, f: F) -> Result<super::RawOutcome, StrategyError>
where
    F: FnOnce() -> Result<super::RawOutcome, StrategyError> + Send + 'static,
{
    match tokio::time::timeout(deadline + DEADLINE_GRACE, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StrategyError::Runtime(format!(
            "strategy task failed: {}",
            join_error
        ))),
        Err(_) => Err(StrategyError::Timeout),
    }
}

/// Resolves an `emit` target. A bare `emit(value)` lands on the topic
/// itself; `emit(subpath, value)` lands on `<topic>/<subpath>` whether
/// the subpath is written `/state` or `state`.
fn resolve_target(topic: &str, subpath: Option<&str>) -> Result<String, StrategyError> {
    let Some(subpath) = subpath else {
        return Ok(topic.to_string());
    };
    let relative = subpath.strip_prefix('/').unwrap_or(subpath);
    if relative.is_empty()
        || relative.split('/').any(|segment| segment.is_empty())
        || relative.contains('+')
        || relative.contains('#')
    {
        return Err(StrategyError::Runtime(format!(
            "invalid emit subpath '{}'",
            subpath
        )));
    }
    Ok(format!("{}/{}", topic, relative))
}
