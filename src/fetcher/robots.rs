use regex::Regex;
use tracing::{info, warn};
use url::Url;

/// Parsed robots.txt. An empty policy allows everything, which is also what
/// a missing or unreachable robots.txt resolves to.
#[derive(Debug, Default, Clone)]
pub struct RobotsPolicy {
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    len: usize,
    pattern: Regex,
}

impl RobotsPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(body: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        // A run of User-agent lines opens one group; the first rule closes the run.
        let mut collecting_agents = false;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !collecting_agents || groups.is_empty() {
                        groups.push(Group {
                            agents: Vec::new(),
                            rules: Vec::new(),
                        });
                    }
                    collecting_agents = true;
                    if let Some(g) = groups.last_mut() {
                        g.agents.push(value.to_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    let Some(group) = groups.last_mut() else {
                        continue;
                    };
                    // "Disallow:" with no path means nothing is disallowed.
                    if value.is_empty() {
                        continue;
                    }
                    if let Some(pattern) = compile_pattern(value) {
                        group.rules.push(Rule {
                            allow: key == "allow",
                            len: value.len(),
                            pattern,
                        });
                    }
                }
                _ => {}
            }
        }

        Self { groups }
    }

    /// Longest matching rule wins; on a tie `Allow` wins.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };
        let path = match Url::parse(url) {
            Ok(u) => match u.query() {
                Some(q) => format!("{}?{}", u.path(), q),
                None => u.path().to_string(),
            },
            Err(_) => url.to_string(),
        };

        let mut best: Option<&Rule> = None;
        for rule in group.rules.iter().filter(|r| r.pattern.is_match(&path)) {
            best = match best {
                Some(b) if b.len > rule.len || (b.len == rule.len && b.allow) => Some(b),
                _ => Some(rule),
            };
        }
        best.map(|r| r.allow).unwrap_or(true)
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let token = user_agent
            .split(['/', ' '])
            .next()
            .unwrap_or("")
            .to_lowercase();

        let specific = self
            .groups
            .iter()
            .filter_map(|g| {
                g.agents
                    .iter()
                    .filter(|a| a.as_str() != "*" && !token.is_empty() && token.contains(a.as_str()))
                    .map(|a| a.len())
                    .max()
                    .map(|len| (len, g))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, g)| g);

        specific.or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")))
    }
}

/// robots.txt path patterns: `*` matches any run, a trailing `$` anchors.
fn compile_pattern(raw: &str) -> Option<Regex> {
    let (body, anchored) = match raw.strip_suffix('$') {
        Some(b) => (b, true),
        None => (raw, false),
    };
    let escaped: Vec<String> = body.split('*').map(regex::escape).collect();
    let mut source = format!("^{}", escaped.join(".*"));
    if anchored {
        source.push('$');
    }
    Regex::new(&source).ok()
}

/// Fetch and parse a robots.txt once. Any failure fails open.
pub async fn load(client: &reqwest::Client, robots_url: &str) -> RobotsPolicy {
    let response = match client.get(robots_url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("Could not fetch {}: {}; assuming allowed", robots_url, e);
            return RobotsPolicy::allow_all();
        }
    };
    if !response.status().is_success() {
        warn!(
            "robots.txt at {} returned {}; assuming allowed",
            robots_url,
            response.status()
        );
        return RobotsPolicy::allow_all();
    }
    match response.text().await {
        Ok(body) => {
            let policy = RobotsPolicy::parse(&body);
            info!("Loaded robots policy from {} ({} groups)", robots_url, policy.groups.len());
            policy
        }
        Err(e) => {
            warn!("Could not read {}: {}; assuming allowed", robots_url, e);
            RobotsPolicy::allow_all()
        }
    }
}
