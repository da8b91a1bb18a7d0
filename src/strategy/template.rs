//! Text-template backend.
//!
//! The strategy code *is* the template; rendering it with the context as
//! data yields the single emission, tagged as text. Useful for message
//! formatting and simple value plumbing without a scripting language.

use tera::Tera;

use super::{InvocationContext, RawOutcome, StrategyError};

const TEMPLATE_NAME: &str = "strategy";

pub(crate) fn compile(code: &str) -> Result<Tera, String> {
    let mut tera = Tera::default();
    tera.add_raw_template(TEMPLATE_NAME, code)
        .map_err(|e| error_chain(&e))?;
    Ok(tera)
}

pub(crate) fn run(tera: &Tera, ctx: &InvocationContext) -> Result<RawOutcome, StrategyError> {
    let mut context = tera::Context::new();
    context.insert("inputs", &serde_json::Value::Object(ctx.inputs.clone()));
    context.insert("parameters", &ctx.parameters);
    context.insert("lastOutputs", &ctx.last_outputs);
    context.insert("trigger", &ctx.trigger);

    let rendered = tera
        .render(TEMPLATE_NAME, &context)
        .map_err(|e| StrategyError::Runtime(error_chain(&e)))?;

    Ok(RawOutcome {
        emissions: vec![(None, serde_json::Value::String(rendered))],
        logs: Vec::new(),
    })
}

/// Tera buries the useful message in the error source chain.
fn error_chain(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
