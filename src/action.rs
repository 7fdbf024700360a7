//! Action and sensor-predicate traits: the seam where domain logic plugs in

use crate::models::ActionOutput;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use uuid::Uuid;

/// Execution context handed to every action invocation
#[derive(Debug, Clone)]
pub struct Context {
    pub run_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number for this invocation
    pub attempt: u32,
    /// Declared successors of the node, in graph order. Branch actions pick
    /// their targets from this list.
    pub successors: Vec<String>,
}

/// A unit of work attached to a plain or branch node.
///
/// Plain nodes return any [`ActionOutput::Value`]; branch nodes must return
/// [`ActionOutput::Branch`] naming the successors to activate.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, ctx: &Context) -> anyhow::Result<ActionOutput>;
}

/// A side-effect-free boolean check against external state, polled by
/// sensor nodes until it returns `true` or the poll budget runs out.
#[async_trait]
pub trait SensorPredicate: Send + Sync {
    async fn check(&self, ctx: &Context) -> anyhow::Result<bool>;
}

/// Strategy for choosing one successor among a branch node's candidates
pub trait BranchSelector: Send + Sync {
    fn select(&self, candidates: &[String]) -> Option<String>;
}

/// Uniform random selection among the declared successors
#[derive(Debug, Default)]
pub struct RandomSelector;

impl BranchSelector for RandomSelector {
    fn select(&self, candidates: &[String]) -> Option<String> {
        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Always selects the same target, whether or not it is a candidate.
/// Target validation stays with the engine, so tests can exercise the
/// undeclared-successor path.
#[derive(Debug, Clone)]
pub struct FixedSelector(pub String);

impl BranchSelector for FixedSelector {
    fn select(&self, _candidates: &[String]) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Branch action driven by a pluggable selection strategy over the node's
/// declared successors.
pub struct SelectBranch {
    selector: Box<dyn BranchSelector>,
}

impl SelectBranch {
    pub fn new(selector: Box<dyn BranchSelector>) -> Self {
        Self { selector }
    }

    /// Branch that picks one successor uniformly at random
    pub fn random() -> Self {
        Self::new(Box::new(RandomSelector))
    }

    /// Branch that always picks the given target
    pub fn fixed(target: impl Into<String>) -> Self {
        Self::new(Box::new(FixedSelector(target.into())))
    }
}

#[async_trait]
impl Action for SelectBranch {
    async fn execute(&self, ctx: &Context) -> anyhow::Result<ActionOutput> {
        match self.selector.select(&ctx.successors) {
            Some(target) => Ok(ActionOutput::Branch(vec![target])),
            None => anyhow::bail!(
                "branch node '{}' has no candidate successors",
                ctx.node_id
            ),
        }
    }
}

/// Adapter turning a plain closure into an [`Action`]
pub struct FnAction<F>
where
    F: Fn(&Context) -> anyhow::Result<ActionOutput> + Send + Sync,
{
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Context) -> anyhow::Result<ActionOutput> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Context) -> anyhow::Result<ActionOutput> + Send + Sync,
{
    async fn execute(&self, ctx: &Context) -> anyhow::Result<ActionOutput> {
        (self.f)(ctx)
    }
}

/// Adapter turning a plain closure into a [`SensorPredicate`]
pub struct FnSensor<F>
where
    F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync,
{
    f: F,
}

impl<F> FnSensor<F>
where
    F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> SensorPredicate for FnSensor<F>
where
    F: Fn(&Context) -> anyhow::Result<bool> + Send + Sync,
{
    async fn check(&self, ctx: &Context) -> anyhow::Result<bool> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(successors: Vec<&str>) -> Context {
        Context {
            run_id: Uuid::new_v4(),
            node_id: "pick".to_string(),
            attempt: 1,
            successors: successors.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_random_selector_picks_a_candidate() {
        let candidates = vec![
            "bronze".to_string(),
            "silver".to_string(),
            "gold".to_string(),
        ];
        for _ in 0..20 {
            let chosen = RandomSelector.select(&candidates).unwrap();
            assert!(candidates.contains(&chosen));
        }
    }

    #[test]
    fn test_random_selector_empty_candidates() {
        assert!(RandomSelector.select(&[]).is_none());
    }

    #[test]
    fn test_fixed_selector_ignores_candidates() {
        let selector = FixedSelector("gold".to_string());
        assert_eq!(selector.select(&[]), Some("gold".to_string()));
    }

    #[tokio::test]
    async fn test_select_branch_returns_branch_output() {
        let branch = SelectBranch::fixed("silver");
        let ctx = test_context(vec!["bronze", "silver", "gold"]);

        let output = branch.execute(&ctx).await.unwrap();
        assert_eq!(output, ActionOutput::Branch(vec!["silver".to_string()]));
    }

    #[tokio::test]
    async fn test_select_branch_fails_without_candidates() {
        let branch = SelectBranch::random();
        let ctx = test_context(vec![]);

        assert!(branch.execute(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_fn_action() {
        let action = FnAction::new(|ctx: &Context| {
            Ok(ActionOutput::Value(serde_json::json!({ "node": ctx.node_id })))
        });

        let output = action.execute(&test_context(vec![])).await.unwrap();
        assert_eq!(
            output,
            ActionOutput::Value(serde_json::json!({ "node": "pick" }))
        );
    }

    #[tokio::test]
    async fn test_fn_sensor() {
        let sensor = FnSensor::new(|_ctx: &Context| Ok(true));
        assert!(sensor.check(&test_context(vec![])).await.unwrap());
    }
}
