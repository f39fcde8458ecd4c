// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs::File;
use std::io::prelude::*;
use std::time::Duration;

use crate::param::HttpEncoding;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default = "default_trust_proxy")]
    trust_proxy: bool,
    #[serde(default = "default_subdomain_offset")]
    subdomain_offset: usize,
    #[serde(default = "default_body_limit")]
    body_limit: u64,
    #[serde(default)]
    compression: CompressionConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_threshold")]
    threshold: usize,
    #[serde(default = "default_level")]
    level: u32,
    #[serde(default = "default_preference")]
    preference: Vec<String>,
    #[serde(default = "default_true")]
    cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_bytes")]
    cache_max_bytes: usize,
}

fn default_port() -> u16 {
    7878
}

fn default_local() -> bool {
    true
}

fn default_trust_proxy() -> bool {
    true
}

fn default_subdomain_offset() -> usize {
    2
}

fn default_body_limit() -> u64 {
    102400 // 100KB
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> usize {
    1024 // 1KB
}

fn default_level() -> u32 {
    6
}

fn default_preference() -> Vec<String> {
    vec!["gzip".to_string(), "deflate".to_string(), "br".to_string()]
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_bytes() -> usize {
    16777216 // 16MB
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            level: default_level(),
            preference: default_preference(),
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_bytes: default_cache_max_bytes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            port: default_port(),
            worker_threads: 0,
            local: default_local(),
            trust_proxy: default_trust_proxy(),
            subdomain_offset: default_subdomain_offset(),
            body_limit: default_body_limit(),
            compression: CompressionConfig::default(),
        }
    }

    /// 从 TOML 文件构建配置。文件缺失或格式错误时记录日志并退回默认配置。
    pub fn from_toml(filename: &str) -> Self {
        let mut str_val = String::new();
        let read = File::open(filename).and_then(|mut file| file.read_to_string(&mut str_val));
        if let Err(e) = read {
            error!("无法读取配置文件 {}：{}，使用默认配置", filename, e);
            return Config::new().normalized();
        }
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(content: &str) -> Self {
        let raw_config: Config = match toml::from_str(content) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        raw_config.normalized()
    }

    fn normalized(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = num_cpus::get();
        }
        if self.subdomain_offset == 0 {
            warn!("subdomain_offset被设置为0，所有主机名标签都会被视为子域名。");
        }
        let recognised = self
            .compression
            .preference
            .iter()
            .any(|name| HttpEncoding::from_token(name).is_some());
        if !recognised {
            warn!("compression.preference中没有可识别的编码，将使用默认顺序 gzip, deflate, br。");
            self.compression.preference = default_preference();
        }
        self
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    pub fn subdomain_offset(&self) -> usize {
        self.subdomain_offset
    }

    pub fn body_limit(&self) -> u64 {
        self.body_limit
    }

    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }
}

impl CompressionConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn level(&self) -> u32 {
        self.level.min(11)
    }

    /// 服务端编码偏好顺序，无法识别的名称会被忽略；
    /// 没有任何可识别的名称时使用默认顺序 gzip, deflate, br
    pub fn preference(&self) -> Vec<HttpEncoding> {
        let mut encodings = Vec::new();
        for name in &self.preference {
            match HttpEncoding::from_token(name) {
                Some(e) if !encodings.contains(&e) => encodings.push(e),
                Some(_) => {}
                None => warn!("无法识别的压缩编码：{}，已忽略", name),
            }
        }
        if encodings.is_empty() {
            encodings = vec![HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br];
        }
        encodings
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_max_bytes(&self) -> usize {
        self.cache_max_bytes
    }
}
