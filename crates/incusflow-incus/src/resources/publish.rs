//! Publishing an instance or snapshot as an image

use crate::args;
use crate::client::Incus;
use crate::query;
use crate::request::{Common, Context};
use incusflow_core::{
    AttributeTree, Change, ChangeSet, CommandExecutor, Operation, Outcome, Plan, ReconcileError,
    ResourceAdapter, ResourceIdentity, ResourceKind, Result, scalar_string,
};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct PublishParams {
    pub instance: String,
    pub snapshot: Option<String>,
    pub alias: String,
    #[serde(default)]
    pub public: bool,
    pub expire: Option<String>,
    /// Replace the image behind an existing alias
    #[serde(default)]
    pub reuse: bool,
    pub compression: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub common: Common,
}

impl PublishParams {
    pub fn adapter(self, ctx: &Context) -> Result<PublishAdapter> {
        if self.alias.is_empty() {
            return Err(ReconcileError::configuration("alias must not be empty"));
        }
        let client = ctx.client(&self.common);
        let source = match &self.snapshot {
            Some(snapshot) => format!("{}/{}", self.instance, snapshot),
            None => self.instance.clone(),
        };

        let mut args = args!["publish", client.qualify(&source)];
        if let Some(remote) = client.scope().remote_arg() {
            args.push(remote);
        }
        args.push(format!("--alias={}", self.alias));
        if self.public {
            args.push("--public".to_string());
        }
        if self.reuse {
            args.push("--reuse".to_string());
        }
        if let Some(expire) = &self.expire {
            args.push(format!("--expire={}", expire));
        }
        if let Some(compression) = &self.compression {
            args.push(format!("--compression={}", compression));
        }
        for (key, value) in &self.properties {
            if let Some(value) = scalar_string(value) {
                args.push(format!("{}={}", key, value));
            }
        }

        Ok(PublishAdapter {
            identity: ResourceIdentity::new(
                client.scope().clone(),
                ResourceKind::Publish,
                [self.alias.clone()],
            ),
            client,
            alias: self.alias,
            source,
            reuse: self.reuse,
            args,
        })
    }
}

pub struct PublishAdapter {
    client: Incus,
    identity: ResourceIdentity,
    alias: String,
    source: String,
    reuse: bool,
    args: Vec<String>,
}

impl ResourceAdapter for PublishAdapter {
    fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// The image alias entry
    fn fetch(&self, exec: &dyn CommandExecutor) -> Result<Option<AttributeTree>> {
        query::probe(exec, &self.client, &format!("/1.0/images/aliases/{}", self.alias))
    }

    fn plan(&self, _exec: &dyn CommandExecutor, current: Option<&AttributeTree>) -> Result<Plan> {
        if current.is_some() && !self.reuse {
            return Ok(Plan::unchanged(format!("Image alias {} already exists", self.alias)));
        }
        let mut changes = ChangeSet::new();
        changes.push(
            Operation::run(
                Change::action("publish", format!("{} as {}", self.source, self.alias)),
                self.client.invocation(self.args.clone()),
            )
            .captured(),
        );
        Ok(Plan::new(changes, format!("Image {} published from {}", self.alias, self.source)))
    }

    fn finish(&self, outcome: &mut Outcome) -> Result<()> {
        let fingerprint = match outcome.captured.first() {
            Some(output) => published_fingerprint(&output.stdout_str()),
            None => outcome
                .final_state
                .as_ref()
                .and_then(|alias| alias.str_field("target"))
                .map(str::to_string),
        };
        if let Some(fingerprint) = fingerprint {
            outcome.payload.insert("fingerprint".into(), Value::String(fingerprint));
        }
        Ok(())
    }
}

/// Fingerprint from "Instance published with fingerprint: <hash>"
fn published_fingerprint(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| line.contains("published with fingerprint:"))
        .and_then(|line| line.rsplit(':').next())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use incusflow_core::Reconciler;
    use incusflow_core::mock::{ScriptedExecutor, ok};
    use serde_json::json;

    fn adapter(value: Value) -> PublishAdapter {
        serde_json::from_value::<PublishParams>(value)
            .unwrap()
            .adapter(&Context::default())
            .unwrap()
    }

    #[test]
    fn test_publish_reports_fingerprint() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["publish"],
            ok("Instance published with fingerprint: 8d4ef1a2b3c4\n"),
        );

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({
                "instance": "web",
                "snapshot": "snap0",
                "alias": "web-image",
                "public": true,
                "properties": {"os": "debian", "release": 12}
            })))
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.payload["fingerprint"], "8d4ef1a2b3c4");
        assert!(exec.called(&[
            "publish",
            "web/snap0",
            "--alias=web-image",
            "--public",
            "os=debian",
            "release=12"
        ]));
    }

    #[test]
    fn test_existing_alias_is_left_alone() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["query", "/1.0/images/aliases/web-image"],
            ok(r#"{"name": "web-image", "target": "8d4ef1a2b3c4"}"#),
        );

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"instance": "web", "alias": "web-image"})))
            .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.payload["fingerprint"], "8d4ef1a2b3c4");
        assert!(exec.mutating_calls().is_empty());
    }

    #[test]
    fn test_reuse_republishes() {
        let exec = ScriptedExecutor::new();
        exec.on(
            &["query", "/1.0/images/aliases/web-image"],
            ok(r#"{"name": "web-image", "target": "aaaa"}"#),
        );
        exec.on(&["publish"], ok("Instance published with fingerprint: bbbb\n"));

        let outcome = Reconciler::new(&exec)
            .reconcile(&adapter(json!({"instance": "web", "alias": "web-image", "reuse": true})))
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.payload["fingerprint"], "bbbb");
        assert!(exec.called(&["--reuse"]));
    }

    #[test]
    fn test_published_fingerprint() {
        assert_eq!(published_fingerprint("nothing here"), None);
        assert_eq!(
            published_fingerprint("Publishing instance: 100%\nInstance published with fingerprint: abc\n"),
            Some("abc".to_string())
        );
    }
}
