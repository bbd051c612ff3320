//! Stack commands
//!
//! - `plan` - Show what apply would change
//! - `apply` - Converge the stack to its declaration
//! - `destroy` - Delete everything recorded in state

use anyhow::{Context as AnyhowContext, Result, bail};
use dialoguer::Confirm;
use resgraph::{
    Applier, ApplyOptions, FileStateStore, Graph, GraphBuilder, Plan, ProviderRegistry,
    StateSnapshot, StateStore,
};
use std::io::IsTerminal;
use std::sync::Arc;

use crate::Context;
use crate::cli::RunArgs;
use crate::config::StackFile;
use crate::paths;
use crate::progress::ProgressObserver;
use crate::ui;

/// Everything a command needs about one stack
struct Workspace {
    stack: StackFile,
    store: FileStateStore,
    prior: StateSnapshot,
}

impl Workspace {
    fn open(ctx: &Context) -> Result<Self> {
        let stack = StackFile::load(&ctx.stack_file)?;
        let state_dir = paths::state_dir(ctx.state_dir.as_deref())?;
        let store = FileStateStore::for_stack(&state_dir, &stack.stack);
        let prior = store
            .load()
            .with_context(|| format!("Failed to load state from {}", store.path().display()))?;
        Ok(Self {
            stack,
            store,
            prior,
        })
    }

    fn declared_graph(&self) -> Result<Arc<Graph>> {
        let mut builder = GraphBuilder::new();
        self.stack.declare(&mut builder)?;
        let graph = builder.build().context("Invalid stack")?;
        Ok(Arc::new(graph))
    }

    fn registry(&self) -> ProviderRegistry {
        self.stack.registry()
    }
}

/// Show what `apply` would change
pub fn plan(ctx: &Context, target: Option<&str>) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let plan = resgraph::plan(ws.declared_graph()?, &ws.prior).filter_by_target(target);

    if !ctx.quiet {
        ui::header(&format!("Plan for stack '{}'", ws.stack.stack));
    }
    if plan.has_changes() {
        ui::plan(&plan, ctx.verbose > 0);
    } else {
        ui::success("No changes. Stack is up to date.");
    }
    Ok(())
}

/// Converge the stack to its declaration
pub fn apply(ctx: &Context, target: Option<&str>, run: &RunArgs) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let plan = resgraph::plan(ws.declared_graph()?, &ws.prior).filter_by_target(target);
    execute(ctx, &ws, &plan, run, "Apply")
}

/// Delete every resource recorded in state, dependents first
pub fn destroy(ctx: &Context, run: &RunArgs) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    if ws.prior.is_empty() {
        ui::warn(&format!("Nothing recorded for stack '{}'", ws.stack.stack));
        return Ok(());
    }
    let empty = Arc::new(GraphBuilder::new().build()?);
    let plan = resgraph::plan(empty, &ws.prior);
    execute(ctx, &ws, &plan, run, "Destroy")
}

fn execute(ctx: &Context, ws: &Workspace, plan: &Plan, run: &RunArgs, verb: &str) -> Result<()> {
    if !ctx.quiet {
        ui::header(&format!("{verb} stack '{}'", ws.stack.stack));
    }

    if !plan.has_changes() {
        ui::success("No changes. Stack is up to date.");
        return Ok(());
    }
    ui::plan(plan, ctx.verbose > 0);

    if !run.yes && !confirm(verb)? {
        ui::info("Cancelled");
        return Ok(());
    }

    let applier = Applier::new(
        ws.registry(),
        ApplyOptions {
            parallelism: usize::from(run.parallelism),
            fail_fast: run.fail_fast,
            ..ApplyOptions::default()
        },
    );

    let mut observer = ProgressObserver::new(plan.len(), ctx.quiet, ctx.verbose > 0);
    let report = applier
        .apply_with(plan, &ctx.cancel, &mut observer)
        .context("Failed to run apply")?;
    observer.finish();

    let mut next = ws.prior.reconcile(&report);
    next.stack = Some(ws.stack.stack.clone());
    ws.store
        .save(&next)
        .with_context(|| format!("Failed to save state to {}", ws.store.path().display()))?;
    if ctx.verbose > 0 {
        ui::kv("State", &ws.store.path().display().to_string());
    }

    ui::report(&report);
    if ctx.cancel.is_cancelled() {
        bail!("{verb} interrupted; state records the steps that finished");
    }
    if !report.is_success() {
        bail!("{verb} finished with {} failed resources", report.summary().failed);
    }
    Ok(())
}

fn confirm(verb: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("Not running in a terminal; pass --yes to {} without confirmation", verb.to_lowercase());
    }
    println!();
    Confirm::new()
        .with_prompt("Continue?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use resgraph::CancelToken;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const STACK: &str = r#"
stack = "mlplatform"

[[resource]]
type = "kubernetes:core/v1:Namespace"
name = "mlflow-namespace"
inputs = { name = "mlflow" }

[[resource]]
type = "kubernetes:core/v1:ServiceAccount"
name = "mlflow"
inputs = { namespace = { from = "kubernetes:core/v1:Namespace::mlflow-namespace", attribute = "name" } }
"#;

    fn context(dir: &Path) -> Context {
        let stack_file = dir.join("stack.toml");
        fs::write(&stack_file, STACK).unwrap();
        Context {
            verbose: 0,
            quiet: true,
            stack_file,
            state_dir: Some(dir.join("state").display().to_string()),
            cancel: CancelToken::new(),
        }
    }

    fn run_args() -> RunArgs {
        RunArgs {
            parallelism: 2,
            fail_fast: false,
            yes: true,
        }
    }

    fn recorded(ctx: &Context) -> StateSnapshot {
        Workspace::open(ctx).unwrap().prior
    }

    #[test]
    fn test_apply_then_destroy() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());

        apply(&ctx, None, &run_args()).unwrap();
        let state = recorded(&ctx);
        assert_eq!(state.len(), 2);
        assert_eq!(state.stack.as_deref(), Some("mlplatform"));
        assert!(dir.path().join("state").join("mlplatform.json").exists());

        let ws = Workspace::open(&ctx).unwrap();
        let again = resgraph::plan(ws.declared_graph().unwrap(), &ws.prior);
        assert!(!again.has_changes());

        destroy(&ctx, &run_args()).unwrap();
        assert!(recorded(&ctx).is_empty());
    }

    #[test]
    fn test_targeted_apply_records_only_target() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());

        apply(&ctx, Some("kubernetes:core/v1:Namespace"), &run_args()).unwrap();
        assert_eq!(recorded(&ctx).len(), 1);
    }

    #[test]
    fn test_interrupted_apply_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        ctx.cancel.cancel();

        let err = apply(&ctx, None, &run_args()).unwrap_err();
        assert!(err.to_string().contains("interrupted"));
        assert!(recorded(&ctx).is_empty());
    }

    #[test]
    fn test_failed_resource_fails_the_command() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        fs::write(
            &ctx.stack_file,
            r#"
stack = "broken"

[providers.missing]
command = "strata-provider-that-does-not-exist"

[[resource]]
type = "t"
name = "a"
provider = "missing"
"#,
        )
        .unwrap();

        assert!(apply(&ctx, None, &run_args()).is_err());
        assert!(recorded(&ctx).is_empty());
    }

    #[test]
    fn test_missing_stack_file() {
        let dir = TempDir::new().unwrap();
        let ctx = Context {
            verbose: 0,
            quiet: true,
            stack_file: dir.path().join("nope.toml"),
            state_dir: Some(dir.path().display().to_string()),
            cancel: CancelToken::new(),
        };
        assert!(plan(&ctx, None).is_err());
    }
}
