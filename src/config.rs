//! Configuração do gbatch carregada a partir de `gbatch.toml`.
//!
//! A struct [`GbatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `GBATCH_STATE_DIR` tem precedência sobre o arquivo;
//! flags da CLI têm precedência sobre ambos.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::discovery::{DiscoveryRule, JobTemplate};
use crate::executor::AbortPolicy;

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "gbatch.toml";

/// Configuração de nível superior carregada de `gbatch.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GbatchConfig {
    /// Diretório onde as sessões são persistidas.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Número máximo de unidades em execução simultânea.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Retentativas automáticas após a primeira tentativa.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Tempo máximo de uma tentativa, em segundos. Ausente = sem limite.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Tempo concedido a um processo para terminar após um abort.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,

    /// O que fazer com processos em execução quando a sessão é abortada.
    #[serde(default)]
    pub on_abort: AbortPolicy,

    /// Intervalo de verificação do sinal de abort.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Regra de descoberta das unidades de trabalho.
    #[serde(default)]
    pub discovery: DiscoveryRule,

    /// Modelo do comando executado por unidade.
    #[serde(default)]
    pub job: JobTemplate,
}

// Valor padrão para o diretório de estado: ".gbatch".
fn default_state_dir() -> PathBuf {
    PathBuf::from(".gbatch")
}

// Valor padrão para o orçamento de retentativas: 1.
fn default_retry_budget() -> u32 {
    1
}

// Valor padrão para o período de graça: 30s.
fn default_abort_grace_secs() -> u64 {
    30
}

// Valor padrão para o intervalo de verificação: 250ms.
fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for GbatchConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            concurrency: None,
            retry_budget: default_retry_budget(),
            timeout_secs: None,
            abort_grace_secs: default_abort_grace_secs(),
            on_abort: AbortPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
            discovery: DiscoveryRule::default(),
            job: JobTemplate::default(),
        }
    }
}

impl GbatchConfig {
    /// Carrega a configuração de `path` ou, sem caminho explícito, de
    /// `gbatch.toml` no diretório atual.
    ///
    /// Um caminho explícito inexistente é erro; o arquivo padrão ausente
    /// resulta nos valores padrão.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file {} does not exist", path.display());
                }
                Self::from_file(path)?
            }
            None => {
                let path = Path::new(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var("GBATCH_STATE_DIR")
            && !dir.is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<GbatchConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Rejeita valores que tornariam a execução impossível.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            bail!("concurrency must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be at least 1");
        }
        if self.timeout_secs == Some(0) {
            bail!("timeout_secs must be at least 1");
        }
        self.discovery
            .validate()
            .context("invalid [discovery] section")?;
        Ok(())
    }

    /// Concorrência efetiva: a configurada ou o paralelismo disponível.
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Número de CPUs disponíveis, ou 1 se não puder ser determinado.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
