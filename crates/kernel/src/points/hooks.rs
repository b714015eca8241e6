//! Points hook instance storage.
//!
//! Each hook handler keeps its instances in one option, `wordpoints_hook-{id_base}`,
//! mapping instance number to settings. In network mode the network option is
//! used instead of the site option. Instances are tied to points types through
//! `wordpoints_points_types_hooks`, which maps a points type slug to hook ids
//! of the form `{id_base}-{number}`.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result, bail};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::host::Host;

/// Option mapping points types to the hook ids awarding them.
pub const POINTS_TYPES_HOOKS_OPTION: &str = "wordpoints_points_types_hooks";

/// Settings of one hook instance.
pub type HookSettings = Map<String, Value>;

/// The kinds of points hook handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookHandler {
    Post,
    PostDelete,
    Comment,
    CommentRemoved,
    Other(String),
}

impl HookHandler {
    pub fn id_base(&self) -> &str {
        match self {
            Self::Post => "wordpoints_post_points_hook",
            Self::PostDelete => "wordpoints_post_delete_points_hook",
            Self::Comment => "wordpoints_comment_points_hook",
            Self::CommentRemoved => "wordpoints_comment_removed_points_hook",
            Self::Other(id_base) => id_base,
        }
    }

    /// Option holding this handler's instances.
    pub fn option_name(&self) -> String {
        format!("wordpoints_hook-{}", self.id_base())
    }

    pub fn hook_id(&self, number: u64) -> String {
        format!("{}-{}", self.id_base(), number)
    }
}

/// Adjusts instance settings before they are saved.
pub trait SettingsCleaner: Send + Sync {
    fn clean(&self, handler: &HookHandler, settings: &mut HookSettings);
}

/// Drops the pre-1.4.0 split settings from post and comment hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacySplitCleaner;

impl SettingsCleaner for LegacySplitCleaner {
    fn clean(&self, handler: &HookHandler, settings: &mut HookSettings) {
        match handler {
            HookHandler::Post => {
                settings.remove("trash");
                settings.remove("publish");
            }
            HookHandler::Comment => {
                settings.remove("approve");
                settings.remove("disapprove");
            }
            HookHandler::PostDelete | HookHandler::CommentRemoved | HookHandler::Other(_) => {}
        }
    }
}

/// Reads and writes hook instances for the current site or the network.
#[derive(Debug, Default)]
pub struct PointsHooks {
    network_mode: Mutex<bool>,
}

impl PointsHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether instances are read from network options.
    pub fn network_mode(&self) -> bool {
        *self.network_mode.lock()
    }

    pub fn set_network_mode(&self, on: bool) {
        *self.network_mode.lock() = on;
    }

    async fn read(&self, host: &Host, option: &str) -> Result<Option<Value>> {
        let value = if self.network_mode() {
            host.options.get_network_option(option).await
        } else {
            host.options.get_option(option).await
        };
        value.with_context(|| format!("failed to read {option}"))
    }

    async fn write(&self, host: &Host, option: &str, value: Value) -> Result<()> {
        let written = if self.network_mode() {
            host.options.update_network_option(option, value).await
        } else {
            host.options.update_option(option, value).await
        };
        written.with_context(|| format!("failed to write {option}"))
    }

    /// Instances of `handler` keyed by number. Malformed entries are skipped.
    pub async fn instances(
        &self,
        host: &Host,
        handler: &HookHandler,
    ) -> Result<BTreeMap<u64, HookSettings>> {
        let Some(Value::Object(stored)) = self.read(host, &handler.option_name()).await? else {
            return Ok(BTreeMap::new());
        };

        Ok(stored
            .into_iter()
            .filter_map(|(number, settings)| match (number.parse(), settings) {
                (Ok(number), Value::Object(settings)) => Some((number, settings)),
                _ => None,
            })
            .collect())
    }

    async fn save_instances(
        &self,
        host: &Host,
        handler: &HookHandler,
        instances: BTreeMap<u64, HookSettings>,
    ) -> Result<()> {
        let stored: Map<String, Value> = instances
            .into_iter()
            .map(|(number, settings)| (number.to_string(), Value::Object(settings)))
            .collect();
        self.write(host, &handler.option_name(), Value::Object(stored))
            .await
    }

    /// Save one instance, letting `cleaner` adjust the settings first.
    pub async fn update_instance(
        &self,
        host: &Host,
        handler: &HookHandler,
        number: u64,
        mut settings: HookSettings,
        cleaner: &dyn SettingsCleaner,
    ) -> Result<()> {
        cleaner.clean(handler, &mut settings);

        let mut instances = self.instances(host, handler).await?;
        instances.insert(number, settings);

        debug!(hook = %handler.hook_id(number), "saving hook instance");
        self.save_instances(host, handler, instances).await
    }

    pub async fn delete_instance(&self, host: &Host, handler: &HookHandler, number: u64) -> Result<()> {
        let mut instances = self.instances(host, handler).await?;
        if instances.remove(&number).is_some() {
            debug!(hook = %handler.hook_id(number), "deleting hook instance");
            self.save_instances(host, handler, instances).await?;
        }
        Ok(())
    }

    /// The number the next new instance of `handler` gets.
    pub async fn next_number(&self, host: &Host, handler: &HookHandler) -> Result<u64> {
        let instances = self.instances(host, handler).await?;
        Ok(instances.keys().next_back().map_or(1, |last| last + 1))
    }

    /// Points type slug → hook ids.
    pub async fn points_types_hooks(&self, host: &Host) -> Result<PointsTypesHooks> {
        match self.read(host, POINTS_TYPES_HOOKS_OPTION).await? {
            Some(value) => PointsTypesHooks::decode(value)
                .with_context(|| format!("malformed {POINTS_TYPES_HOOKS_OPTION}")),
            None => Ok(PointsTypesHooks::default()),
        }
    }

    pub async fn save_points_types_hooks(&self, host: &Host, hooks: &PointsTypesHooks) -> Result<()> {
        self.write(host, POINTS_TYPES_HOOKS_OPTION, hooks.encode()).await
    }
}

/// Hook ids per points type, as stored in `wordpoints_points_types_hooks`.
///
/// A slug's ids may be stored as a list or as an object keyed by position.
/// Entries that are neither are kept as they were and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointsTypesHooks {
    pub hooks: BTreeMap<String, Vec<String>>,
    unrecognized: Map<String, Value>,
}

impl PointsTypesHooks {
    pub fn decode(value: Value) -> Result<Self> {
        let entries = match value {
            Value::Object(entries) => entries,
            Value::Null => return Ok(Self::default()),
            Value::Array(list) if list.is_empty() => return Ok(Self::default()),
            other => bail!("expected an object of points types, found {other}"),
        };

        let mut decoded = Self::default();
        for (slug, ids) in entries {
            match hook_ids(&ids) {
                Some(ids) => {
                    decoded.hooks.insert(slug, ids);
                }
                None => {
                    warn!(points_type = %slug, "keeping unrecognized points type hooks entry");
                    decoded.unrecognized.insert(slug, ids);
                }
            }
        }
        Ok(decoded)
    }

    pub fn encode(&self) -> Value {
        let mut entries = self.unrecognized.clone();
        for (slug, ids) in &self.hooks {
            entries.insert(slug.clone(), json!(ids));
        }
        Value::Object(entries)
    }
}

/// Hook ids from a list, or from an object with numeric keys in key order.
fn hook_ids(value: &Value) -> Option<Vec<String>> {
    let as_id = |id: &Value| id.as_str().map(str::to_string);
    match value {
        Value::Array(ids) => ids.iter().map(as_id).collect(),
        Value::Object(ids) => {
            let mut positioned = ids
                .iter()
                .map(|(position, id)| Some((position.parse::<u64>().ok()?, as_id(id)?)))
                .collect::<Option<Vec<_>>>()?;
            positioned.sort_by_key(|(position, _)| *position);
            Some(positioned.into_iter().map(|(_, id)| id).collect())
        }
        _ => None,
    }
}

/// Which settings keys a split moves between handlers.
#[derive(Debug, Clone)]
pub struct Split {
    pub from: HookHandler,
    pub into: HookHandler,
    /// Points awarded by the instance that is kept.
    pub key: &'static str,
    /// Points moved to a new instance of `into`.
    pub split_key: &'static str,
}

impl Split {
    pub fn post() -> Self {
        Self {
            from: HookHandler::Post,
            into: HookHandler::PostDelete,
            key: "publish",
            split_key: "trash",
        }
    }

    pub fn comment() -> Self {
        Self {
            from: HookHandler::Comment,
            into: HookHandler::CommentRemoved,
            key: "approve",
            split_key: "disapprove",
        }
    }
}

/// A positive integer number of points, from a number or numeric string.
fn positive_points(value: &Value) -> Option<u64> {
    let points = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (points > 0).then_some(points)
}

/// Split combined instances of `split.from` in two.
///
/// For every instance holding both keys, points under `split_key` move to a
/// new `split.into` instance awarding the same points type, and the original
/// keeps the `key` points (or is deleted when it awards none).
pub async fn split_points_hooks(
    host: &Host,
    hooks: &PointsHooks,
    split: &Split,
    cleaner: &dyn SettingsCleaner,
) -> Result<()> {
    let mut types_hooks = hooks.points_types_hooks(host).await?;
    let instances = hooks.instances(host, &split.from).await?;

    for (number, mut settings) in instances {
        // Number 0 is a placeholder.
        if number == 0 || !settings.contains_key(split.key) || !settings.contains_key(split.split_key)
        {
            continue;
        }

        let old_id = split.from.hook_id(number);
        let post_type = settings
            .entry("post_type")
            .or_insert_with(|| json!("ALL"))
            .clone();

        if let Some(points) = settings.get(split.split_key).and_then(positive_points) {
            let new_number = hooks.next_number(host, &split.into).await?;
            let mut new_settings = HookSettings::new();
            new_settings.insert("points".to_string(), json!(points));
            new_settings.insert("post_type".to_string(), post_type);
            hooks
                .update_instance(host, &split.into, new_number, new_settings, cleaner)
                .await?;

            let new_id = split.into.hook_id(new_number);
            if let Some(ids) = types_hooks
                .hooks
                .values_mut()
                .find(|ids| ids.iter().any(|id| *id == old_id))
            {
                ids.push(new_id);
            }
        }

        if let Some(points) = settings.get(split.key).and_then(positive_points) {
            settings.insert("points".to_string(), json!(points));
            hooks
                .update_instance(host, &split.from, number, settings, cleaner)
                .await?;
        } else {
            hooks.delete_instance(host, &split.from, number).await?;
            for ids in types_hooks.hooks.values_mut() {
                ids.retain(|id| *id != old_id);
            }
        }
    }

    hooks.save_points_types_hooks(host, &types_hooks).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::host::{MemoryHost, OptionStore};

    #[test]
    fn cleaner_matches_on_handler() {
        let mut settings: HookSettings = serde_json::from_value(json!({
            "publish": 10, "trash": 5, "approve": 1, "disapprove": 1, "points": 10
        }))
        .unwrap();

        LegacySplitCleaner.clean(&HookHandler::Post, &mut settings);
        assert!(!settings.contains_key("publish"));
        assert!(!settings.contains_key("trash"));
        assert!(settings.contains_key("approve"));

        LegacySplitCleaner.clean(&HookHandler::Other("x".into()), &mut settings);
        assert!(settings.contains_key("approve"));

        LegacySplitCleaner.clean(&HookHandler::Comment, &mut settings);
        assert!(!settings.contains_key("approve"));
        assert_eq!(settings["points"], json!(10));
    }

    #[test]
    fn positive_points_parsing() {
        assert_eq!(positive_points(&json!(5)), Some(5));
        assert_eq!(positive_points(&json!("7")), Some(7));
        assert_eq!(positive_points(&json!(0)), None);
        assert_eq!(positive_points(&json!(-3)), None);
        assert_eq!(positive_points(&json!("abc")), None);
    }

    #[tokio::test]
    async fn split_moves_trash_points_to_new_instance() {
        let memory = Arc::new(MemoryHost::single_site());
        let host = Host::from_shared(memory.clone());
        let hooks = PointsHooks::new();

        memory
            .update_option(
                "wordpoints_hook-wordpoints_post_points_hook",
                json!({
                    "0": {},
                    "1": {"publish": 20, "trash": 20},
                    "2": {"publish": 0, "trash": 15, "post_type": "page"},
                    "3": {"points": 5}
                }),
            )
            .await
            .unwrap();
        memory
            .update_option(
                POINTS_TYPES_HOOKS_OPTION,
                json!({"points": ["wordpoints_post_points_hook-1", "wordpoints_post_points_hook-2"]}),
            )
            .await
            .unwrap();

        split_points_hooks(&host, &hooks, &Split::post(), &LegacySplitCleaner)
            .await
            .unwrap();

        let post = hooks.instances(&host, &HookHandler::Post).await.unwrap();
        assert_eq!(post.len(), 3);
        assert_eq!(post[&1], serde_json::from_value::<HookSettings>(json!({"points": 20, "post_type": "ALL"})).unwrap());
        assert!(!post.contains_key(&2));
        assert_eq!(post[&3]["points"], json!(5));

        let delete = hooks.instances(&host, &HookHandler::PostDelete).await.unwrap();
        assert_eq!(delete[&1]["points"], json!(20));
        assert_eq!(delete[&2]["points"], json!(15));
        assert_eq!(delete[&2]["post_type"], json!("page"));

        let types = hooks.points_types_hooks(&host).await.unwrap();
        assert_eq!(
            types.hooks["points"],
            vec![
                "wordpoints_post_points_hook-1".to_string(),
                "wordpoints_post_delete_points_hook-1".to_string(),
                "wordpoints_post_delete_points_hook-2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn split_keeps_positional_and_unrecognized_types_hooks() {
        let memory = Arc::new(MemoryHost::single_site());
        let host = Host::from_shared(memory.clone());
        let hooks = PointsHooks::new();

        memory
            .update_option(
                "wordpoints_hook-wordpoints_post_points_hook",
                json!({"1": {"publish": 10, "trash": 5}}),
            )
            .await
            .unwrap();
        memory
            .update_option(
                POINTS_TYPES_HOOKS_OPTION,
                json!({
                    "points": {
                        "2": "wordpoints_registration_points_hook-1",
                        "0": "wordpoints_post_points_hook-1"
                    },
                    "gold": ["wordpoints_comment_points_hook-3"],
                    "silver": 7
                }),
            )
            .await
            .unwrap();

        split_points_hooks(&host, &hooks, &Split::post(), &LegacySplitCleaner)
            .await
            .unwrap();

        assert_eq!(
            memory.get_option(POINTS_TYPES_HOOKS_OPTION).await.unwrap(),
            Some(json!({
                "points": [
                    "wordpoints_post_points_hook-1",
                    "wordpoints_registration_points_hook-1",
                    "wordpoints_post_delete_points_hook-1"
                ],
                "gold": ["wordpoints_comment_points_hook-3"],
                "silver": 7
            }))
        );
    }

    #[tokio::test]
    async fn split_fails_on_unreadable_types_hooks() {
        let memory = Arc::new(MemoryHost::single_site());
        let host = Host::from_shared(memory.clone());
        let hooks = PointsHooks::new();

        memory
            .update_option(POINTS_TYPES_HOOKS_OPTION, json!("corrupt"))
            .await
            .unwrap();

        let error = split_points_hooks(&host, &hooks, &Split::post(), &LegacySplitCleaner)
            .await
            .unwrap_err();
        assert!(error.to_string().contains(POINTS_TYPES_HOOKS_OPTION));
        assert_eq!(
            memory.get_option(POINTS_TYPES_HOOKS_OPTION).await.unwrap(),
            Some(json!("corrupt"))
        );
    }

    #[tokio::test]
    async fn network_mode_uses_network_options() {
        let memory = Arc::new(MemoryHost::multisite());
        let host = Host::from_shared(memory.clone());
        let hooks = PointsHooks::new();
        hooks.set_network_mode(true);

        memory
            .update_network_option(
                "wordpoints_hook-wordpoints_comment_points_hook",
                json!({"1": {"approve": 3, "disapprove": 3}}),
            )
            .await
            .unwrap();

        split_points_hooks(&host, &hooks, &Split::comment(), &LegacySplitCleaner)
            .await
            .unwrap();

        assert!(
            memory
                .get_network_option("wordpoints_hook-wordpoints_comment_removed_points_hook")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            memory
                .get_option("wordpoints_hook-wordpoints_comment_removed_points_hook")
                .await
                .unwrap()
                .is_none()
        );
    }
}
