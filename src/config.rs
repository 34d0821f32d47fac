//! Configuration parsing for CoreDNS

use crate::plugin::{create_plugin, SharedState, Plugin};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PluginConfig {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<PluginConfig>,
}

pub struct Config {
    pub zones: Vec<ZoneConfig>,
}

pub struct ZoneConfig {
    pub name: String,
    pub plugins: Vec<Box<dyn Plugin>>,
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

struct RawZone { name: String, plugins: Vec<PluginConfig> }

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &str, shared: Arc<SharedState>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content, shared)
    }

    pub fn parse(content: &str, shared: Arc<SharedState>) -> Result<Self> {
        let tokens = Self::lex(content);
        let raw_zones = Self::parse_tokens(&tokens)?;
        let mut zones = Vec::new();
        
        for raw in raw_zones {
            let mut plugins = Vec::new();
            for p_cfg in &raw.plugins {
                // 任何插件配置错误都直接中止启动，不再静默跳过
                let plugin = create_plugin(p_cfg, shared.clone())
                    .with_context(|| format!("zone '{}', plugin '{}'", raw.name, p_cfg.name))?;
                plugins.push(plugin);
            }

            // 插件的执行顺序由内置的 Priority 决定，与 Corefile 书写顺序无关。
            // 按照优先级从大到小排序 (比如 dnsnameresolver:180 必须在 forward:100 之前)
            plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
            
            zones.push(ZoneConfig { name: raw.name, plugins });
        }
        Ok(Config { zones })
    }

    fn lex(input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '\n' { tokens.push(Token::Newline); chars.next(); } 
            else if c.is_whitespace() { chars.next(); } 
            else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } } 
            else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); } 
            else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); } 
            else if c == '"' {
                chars.next(); 
                let mut s = String::new();
                while let Some(&c) = chars.peek() { if c == '"' { chars.next(); break; } s.push(c); chars.next(); }
                tokens.push(Token::Text(s));
            } else {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '#' || c == '{' || c == '}' || c == '"' { break; }
                    s.push(c); chars.next();
                }
                tokens.push(Token::Text(s));
            }
        }
        tokens
    }

    fn parse_tokens(tokens: &[Token]) -> Result<Vec<RawZone>> {
        let mut i = 0;
        let mut zones = Vec::new();
        let mut zone_names = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Text(s) => { zone_names.push(s.clone()); i += 1; }
                Token::OpenBrace => {
                    i += 1;
                    let (plugins, next_i) = Self::parse_block(tokens, i)?;
                    i = next_i;
                    for name in zone_names.drain(..) { zones.push(RawZone { name, plugins: plugins.clone() }); }
                }
                Token::Newline => { i += 1; zone_names.clear(); }
                Token::CloseBrace => { anyhow::bail!("unexpected '}}' outside of a server block"); }
            }
        }
        if !zone_names.is_empty() {
            anyhow::bail!("server block {:?} is missing its '{{'", zone_names);
        }
        Ok(zones)
    }

    /// Parse a configuration block starting at position i
    fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<PluginConfig>, usize)> {
        let mut plugins = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Newline => { i += 1; }
                Token::CloseBrace => { i += 1; return Ok((plugins, i)); }
                Token::Text(name) => {
                    let plugin_name = name.clone(); i += 1;
                    let mut args = Vec::new();
                    let mut block = Vec::new();
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                            Token::OpenBrace => {
                                i += 1;
                                let (sub_block, next_i) = Self::parse_block(tokens, i)?;
                                block = sub_block; i = next_i; break;
                            }
                            Token::Newline | Token::CloseBrace => { break; }
                        }
                    }
                    plugins.push(PluginConfig { name: plugin_name, args, block });
                }
                _ => { i += 1; }
            }
        }
        anyhow::bail!("unterminated block, expected '}}'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::plugin::dnsnameresolver::informer::ChannelInformer;

    fn shared() -> Arc<SharedState> {
        let (informer, _feed) = ChannelInformer::new();
        Arc::new(SharedState::new(Some(informer)))
    }

    #[test]
    fn parses_zones_and_orders_plugins_by_priority() {
        let corefile = r#"
# cluster resolver
.:1053 {
    forward . 127.0.0.1:5353 {
        policy sequential
    }
    dnsnameresolver
}
"#;
        let cfg = Config::parse(corefile, shared()).unwrap();
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.zones[0].name, ".:1053");
        let names: Vec<&str> = cfg.zones[0].plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["dnsnameresolver", "forward"]);
    }

    #[test]
    fn nested_blocks_and_quotes() {
        let tokens = Config::lex("a.com {\n forward . \"1.1.1.1\" { except b.com }\n}\n");
        let zones = Config::parse_tokens(&tokens).unwrap();
        assert_eq!(zones.len(), 1);
        let forward = &zones[0].plugins[0];
        assert_eq!(forward.args, vec![".", "1.1.1.1"]);
        assert_eq!(forward.block[0].name, "except");
        assert_eq!(forward.block[0].args, vec!["b.com"]);
    }

    #[test]
    fn plugin_errors_abort_parsing() {
        let err = Config::parse(".:53 {\n dnsnameresolver extra\n}\n", shared()).err().unwrap();
        assert!(matches!(err.downcast_ref::<ResolverError>(), Some(ResolverError::Config(_))));

        let err = Config::parse(".:53 {\n dnsnameresolver {\n ttl 30\n }\n}\n", shared()).err().unwrap();
        assert!(matches!(err.downcast_ref::<ResolverError>(), Some(ResolverError::Config(_))));

        assert!(Config::parse(".:53 {\n nosuchplugin\n}\n", shared()).is_err());
    }

    #[test]
    fn unbalanced_braces_are_rejected() {
        assert!(Config::parse(".:53 {\n forward . 1.1.1.1\n", shared()).is_err());
        assert!(Config::parse("}\n", shared()).is_err());
    }
}
