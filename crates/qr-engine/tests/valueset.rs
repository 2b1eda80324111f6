use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;

use qr_engine::valueset::expander_for;
use qr_engine::{
    AnswerValue, Coding, EngineConfig, ExpansionCache, ExpansionError, FormEngine,
    LocalExpansionTable, OptionsState, ValueSetExpander, load_options,
};

const COLORS: &str = "http://example.org/ValueSet/colors";

struct CountingExpander {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingExpander {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValueSetExpander for CountingExpander {
    async fn expand(&self, url: &str) -> Result<Vec<Coding>, ExpansionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            return Err(ExpansionError::Transport("connection refused".into()));
        }
        Ok(vec![Coding::new(url, "red")])
    }
}

fn colors() -> Vec<Coding> {
    vec![
        Coding::new("http://example.org/colors", "red").with_display("Red"),
        Coding::new("http://example.org/colors", "blue").with_display("Blue"),
    ]
}

fn color_form(value_set: &str) -> FormEngine {
    let definition = serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "contained": [{
            "resourceType": "ValueSet",
            "id": "colors",
            "url": COLORS,
            "compose": {"include": [{
                "system": "http://example.org/colors",
                "concept": [
                    {"code": "red", "display": "Red"},
                    {"code": "blue", "display": "Blue"}
                ]
            }]}
        }],
        "item": [
            {"linkId": "color", "type": "coding", "answerValueSet": value_set},
            {"linkId": "size", "type": "coding", "answerOption": [
                {"valueCoding": {"system": "http://example.org/sizes", "code": "s"}}
            ]}
        ]
    }))
    .expect("definition");
    FormEngine::open(definition, None, EngineConfig::default())
}

fn as_answers(codings: Vec<Coding>) -> Vec<AnswerValue> {
    codings.into_iter().map(AnswerValue::Coding).collect()
}

#[tokio::test]
async fn concurrent_expansions_share_one_call() {
    let expander = CountingExpander::new(false);
    let cache = ExpansionCache::new(expander.clone());

    let (first, second) = futures::join!(cache.expand(COLORS), cache.expand(COLORS));
    assert_eq!(first, second);
    assert_eq!(expander.calls(), 1);

    cache.expand(COLORS).await.expect("cached");
    assert_eq!(expander.calls(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn failed_expansions_are_retried() {
    let expander = CountingExpander::new(true);
    let cache = ExpansionCache::new(expander.clone());

    let error = cache.expand(COLORS).await.expect_err("fails");
    assert_eq!(error, ExpansionError::Transport("connection refused".into()));
    assert!(cache.is_empty());

    cache.expand(COLORS).await.expect_err("fails again");
    assert_eq!(expander.calls(), 2);
}

#[tokio::test]
async fn contained_value_sets_load_by_local_reference() {
    let mut form = color_form("#colors");
    let color = form.find("color").expect("color");
    assert_eq!(form.options(color), OptionsState::Idle);

    let cache = ExpansionCache::new(expander_for(form.config(), form.definition()));
    let state = load_options(&mut form, color, &cache).await;
    assert_eq!(state, OptionsState::Ready(as_answers(colors())));
}

#[tokio::test]
async fn failed_reload_keeps_previous_options() {
    let mut form = color_form(COLORS);
    let color = form.find("color").expect("color");

    let table = LocalExpansionTable::new().with(COLORS, colors());
    let state = load_options(&mut form, color, &ExpansionCache::new(Arc::new(table))).await;
    assert_eq!(state.available().len(), 2);

    let empty = ExpansionCache::new(Arc::new(LocalExpansionTable::new()));
    let state = load_options(&mut form, color, &empty).await;
    assert_eq!(
        state,
        OptionsState::Failed {
            reason: format!("value set '{COLORS}' is not available"),
            previous: as_answers(colors()),
        }
    );
    assert_eq!(state.available().len(), 2);
}

#[tokio::test]
async fn static_options_need_no_expansion() {
    let mut form = color_form(COLORS);
    let size = form.find("size").expect("size");
    let expander = CountingExpander::new(false);

    let state = load_options(&mut form, size, &ExpansionCache::new(expander.clone())).await;
    assert_eq!(
        state.available(),
        &[AnswerValue::Coding(Coding::new("http://example.org/sizes", "s"))]
    );
    assert_eq!(expander.calls(), 0);
}

#[test]
fn only_the_latest_ticket_is_honored() {
    let mut form = color_form(COLORS);
    let color = form.find("color").expect("color");

    let first = form.request_options(color).expect("request");
    assert_eq!(form.options(color), OptionsState::Loading);
    let second = form.request_options(color).expect("request");
    assert_eq!(second.url, COLORS);

    assert!(!form.resolve_options(first.ticket, Ok(colors())));
    assert_eq!(form.options(color), OptionsState::Loading);
    assert!(form.resolve_options(second.ticket, Ok(colors())));

    let third = form.request_options(color).expect("request");
    form.cancel_options(color);
    assert!(!form.resolve_options(third.ticket, Ok(Vec::new())));
    assert_eq!(form.options(color), OptionsState::Ready(as_answers(colors())));
}
