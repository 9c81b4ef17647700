use std::net::IpAddr;

use crate::config::ViewConfig;
use crate::network::{NetList, NetParseError};

/// 视图兜底规则 / Fallback disposition of a view when neither include nor exclude matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Allow,
    Deny,
    /// Defer to the process-wide [`DefaultRule`].
    Default,
}

impl Rule {
    /// `allow` / `deny` (case-insensitive); anything else is `Default`.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("allow") {
            Rule::Allow
        } else if value.eq_ignore_ascii_case("deny") {
            Rule::Deny
        } else {
            Rule::Default
        }
    }
}

/// 全局默认规则 / Process-wide rule used by views whose rule is [`Rule::Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultRule {
    Allow,
    #[default]
    Deny,
}

impl DefaultRule {
    /// Only `allow` (case-insensitive) yields Allow; every other value is Deny.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("allow") {
            DefaultRule::Allow
        } else {
            DefaultRule::Deny
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

impl Verdict {
    #[inline]
    pub fn is_keep(self) -> bool {
        matches!(self, Verdict::Keep)
    }
}

#[derive(Debug, Clone)]
pub struct View {
    pub name: String,
    pub sources: NetList,
    pub include: NetList,
    pub exclude: NetList,
    pub rule: Rule,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("view '{view}': {field}: {source}")]
pub struct ViewBuildError {
    pub view: String,
    pub field: &'static str,
    #[source]
    pub source: NetParseError,
}

impl View {
    pub fn from_config(cfg: ViewConfig) -> Result<Self, ViewBuildError> {
        let field_err = |field: &'static str| {
            let view = cfg.name.clone();
            move |source| ViewBuildError {
                view,
                field,
                source,
            }
        };
        let sources = NetList::parse(&cfg.sources).map_err(field_err("sources"))?;
        let include = NetList::parse(&cfg.include).map_err(field_err("include"))?;
        let exclude = NetList::parse(&cfg.exclude).map_err(field_err("exclude"))?;
        let rule = cfg.rule.as_deref().map(Rule::parse).unwrap_or(Rule::Default);
        Ok(Self {
            name: cfg.name,
            sources,
            include,
            exclude,
            rule,
        })
    }

    /// A view without sources never applies to anyone.
    #[inline]
    pub fn matches_client(&self, client: IpAddr) -> bool {
        self.sources.contains(client)
    }

    /// include > exclude > rule. Pure: depends only on the view, `addr` and `default_rule`.
    pub fn decide(&self, addr: IpAddr, default_rule: DefaultRule) -> Verdict {
        if self.include.contains(addr) {
            return Verdict::Keep;
        }
        if self.exclude.contains(addr) {
            return Verdict::Drop;
        }
        match (self.rule, default_rule) {
            (Rule::Allow, _) | (Rule::Default, DefaultRule::Allow) => Verdict::Keep,
            (Rule::Deny, _) | (Rule::Default, DefaultRule::Deny) => Verdict::Drop,
        }
    }
}

/// 按配置顺序保存的视图集合 / Views in configuration order plus the global default rule.
/// Immutable after startup; shared across request tasks behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ViewSet {
    views: Vec<View>,
    default_rule: DefaultRule,
}

impl ViewSet {
    pub fn new(views: Vec<View>, default_rule: DefaultRule) -> Self {
        Self {
            views,
            default_rule,
        }
    }

    pub fn default_rule(&self) -> DefaultRule {
        self.default_rule
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Every view whose sources contain `client`, in configuration order.
    pub fn views_for(&self, client: IpAddr) -> Vec<&View> {
        self.views
            .iter()
            .filter(|v| v.matches_client(client))
            .collect()
    }
}
