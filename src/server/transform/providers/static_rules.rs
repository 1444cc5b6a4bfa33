use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::server::oci::reference::normalize_registry;
use crate::server::oci::{image_name, parse_image, Reference};
use crate::server::transform::{
    models::{RewriteRule, StaticConfig},
    retarget, ContainerTransformer, NotReady, TransformError,
};

/// Transformer that rewrites images using a fixed rule table
///
/// Rules are normalised and validated once at construction and never change,
/// so the transformer is always ready.
pub struct StaticTransformer {
    rules: Vec<RewriteRule>,
}

impl StaticTransformer {
    /// Create a new static transformer from configuration
    pub fn new(config: StaticConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());

        for (index, rule) in config.rules.into_iter().enumerate() {
            let match_prefix = normalize_prefix(&rule.match_prefix);
            let replace = rule.replace.trim_end_matches('/').to_string();

            if match_prefix.is_empty() {
                bail!("static rule #{} has an empty match", index);
            }
            if replace.is_empty() {
                bail!("static rule #{} ({}) has an empty replace", index, match_prefix);
            }
            parse_image(&replace).with_context(|| {
                format!(
                    "static rule #{} ({}) has an invalid replace '{}'",
                    index, match_prefix, replace
                )
            })?;

            rules.push(RewriteRule {
                match_prefix,
                replace,
            });
        }

        tracing::info!("Loaded {} static rewrite rules", rules.len());
        Ok(Self { rules })
    }

    /// Longest matching rule for a `registry/repository` name
    ///
    /// Only a strictly longer prefix replaces the current best, so the
    /// first declared rule wins a tie.
    fn best_rule(&self, name: &str) -> Option<&RewriteRule> {
        let mut best: Option<&RewriteRule> = None;
        for rule in &self.rules {
            if !matches_prefix(name, &rule.match_prefix) {
                continue;
            }
            if best.map_or(true, |b| rule.match_prefix.len() > b.match_prefix.len()) {
                best = Some(rule);
            }
        }
        best
    }
}

#[async_trait]
impl ContainerTransformer for StaticTransformer {
    async fn transform(
        &self,
        image: &Reference,
    ) -> Result<Option<Reference>, TransformError> {
        let name = image_name(image);
        let Some(rule) = self.best_rule(&name) else {
            return Ok(None);
        };

        let target_name = format!("{}{}", rule.replace, &name[rule.match_prefix.len()..]);
        let target = retarget(image, &target_name)?;

        if let Some(target) = &target {
            tracing::debug!(
                rule = %rule.match_prefix,
                "Rewriting {} to {}",
                image,
                target
            );
        }
        Ok(target)
    }

    fn ready(&self) -> Result<(), NotReady> {
        Ok(())
    }

    fn transformer_type(&self) -> &str {
        "static"
    }
}

/// Strip trailing slashes and fold Docker Hub host aliases in a rule prefix
fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim().trim_end_matches('/');
    match prefix.split_once('/') {
        Some((host, path)) => format!("{}/{}", normalize_registry(host), path),
        None => normalize_registry(prefix).to_string(),
    }
}

/// Prefix match on path-component boundaries
///
/// `a.example.com` matches `a.example.com/app` but not `a.example.community/app`.
fn matches_prefix(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(match_prefix: &str, replace: &str) -> RewriteRule {
        RewriteRule {
            match_prefix: match_prefix.to_string(),
            replace: replace.to_string(),
        }
    }

    fn transformer(rules: Vec<RewriteRule>) -> StaticTransformer {
        StaticTransformer::new(StaticConfig { rules }).unwrap()
    }

    async fn rewrite(transformer: &StaticTransformer, image: &str) -> Option<String> {
        let image = parse_image(image).unwrap();
        transformer
            .transform(&image)
            .await
            .unwrap()
            .map(|target| target.to_string())
    }

    #[tokio::test]
    async fn test_docker_hub_rule() {
        let t = transformer(vec![rule("docker.io", "harbor.example.com/proxy-dockerhub")]);

        assert_eq!(
            rewrite(&t, "nginx:1.21").await.as_deref(),
            Some("harbor.example.com/proxy-dockerhub/library/nginx:1.21")
        );
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let t = transformer(vec![
            rule("a.example.com", "x.example.com"),
            rule("a.example.com/team", "y.example.com/team-proxy"),
        ]);

        assert_eq!(
            rewrite(&t, "a.example.com/team/app:1").await.as_deref(),
            Some("y.example.com/team-proxy/app:1")
        );
        assert_eq!(
            rewrite(&t, "a.example.com/other/app:1").await.as_deref(),
            Some("x.example.com/other/app:1")
        );
    }

    #[tokio::test]
    async fn test_first_declared_rule_wins_tie() {
        let t = transformer(vec![
            rule("quay.io", "first.example.com/quay"),
            rule("quay.io/", "second.example.com/quay"),
        ]);

        assert_eq!(
            rewrite(&t, "quay.io/org/app:v1").await.as_deref(),
            Some("first.example.com/quay/org/app:v1")
        );
    }

    #[tokio::test]
    async fn test_prefix_respects_component_boundaries() {
        let t = transformer(vec![rule("a.example.com", "x.example.com")]);

        assert_eq!(rewrite(&t, "a.example.community/app:1").await, None);
    }

    #[tokio::test]
    async fn test_no_matching_rule_is_unchanged() {
        let t = transformer(vec![rule("docker.io", "harbor.example.com/proxy-dockerhub")]);

        assert_eq!(rewrite(&t, "ghcr.io/org/tool:1.0").await, None);
    }

    #[tokio::test]
    async fn test_already_rewritten_image_is_unchanged() {
        let t = transformer(vec![rule("docker.io", "harbor.example.com/proxy-dockerhub")]);

        assert_eq!(
            rewrite(&t, "harbor.example.com/proxy-dockerhub/library/nginx:1.21").await,
            None
        );
    }

    #[tokio::test]
    async fn test_identity_rule_is_unchanged() {
        let t = transformer(vec![rule("quay.io/org", "quay.io/org")]);

        assert_eq!(rewrite(&t, "quay.io/org/app:v1").await, None);
    }

    #[tokio::test]
    async fn test_legacy_docker_hub_prefix_is_normalised() {
        let t = transformer(vec![rule(
            "index.docker.io/",
            "harbor.example.com/proxy-dockerhub/",
        )]);

        assert_eq!(
            rewrite(&t, "bitnami/redis:7").await.as_deref(),
            Some("harbor.example.com/proxy-dockerhub/bitnami/redis:7")
        );
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(StaticTransformer::new(StaticConfig {
            rules: vec![rule("", "harbor.example.com")]
        })
        .is_err());
        assert!(StaticTransformer::new(StaticConfig {
            rules: vec![rule("docker.io", "")]
        })
        .is_err());
        assert!(StaticTransformer::new(StaticConfig {
            rules: vec![rule("docker.io", "Harbor.example.com/Proxy")]
        })
        .is_err());
    }

    #[test]
    fn test_always_ready() {
        let t = transformer(vec![]);
        assert!(t.ready().is_ok());
    }
}
