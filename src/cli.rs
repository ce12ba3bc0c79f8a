//! Interface de linha de comando do gbatch baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (start, resume,
//! status, abort, retry, logs, sessions) e flags globais (--config,
//! --state-dir, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// gbatch: orquestrador de lotes com sessões retomáveis.
#[derive(Debug, Parser)]
#[command(name = "gbatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: ./gbatch.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Diretório onde as sessões são persistidas.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Descobre as unidades de INPUT e executa a sessão.
    Start {
        /// Diretório de entrada.
        input: PathBuf,

        /// Nome da sessão.
        session: String,

        /// Máximo de unidades em execução simultânea.
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,

        /// Retentativas automáticas após a primeira tentativa.
        #[arg(long)]
        retry_budget: Option<u32>,

        /// Tempo máximo por tentativa, em segundos.
        #[arg(long)]
        timeout: Option<u64>,

        /// Padrão glob que seleciona as entradas.
        #[arg(long)]
        pattern: Option<String>,

        /// Comando executado por unidade, após `--`.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Retoma uma sessão existente com o plano salvo.
    Resume {
        session: String,

        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Mostra o estado persistido de cada unidade.
    Status {
        session: String,

        /// Imprime o relatório em JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Pede o cancelamento de uma sessão em execução.
    Abort { session: String },

    /// Recoloca uma unidade falha na fila, com orçamento renovado.
    Retry { session: String, key: String },

    /// Mostra o final do log da última tentativa de uma unidade.
    Logs {
        session: String,
        key: String,

        /// Lê stderr em vez de stdout.
        #[arg(long, default_value_t = false)]
        stderr: bool,

        /// Número de linhas.
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },

    /// Lista as sessões conhecidas.
    Sessions,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_start_with_trailing_command() {
        let cli = Cli::parse_from([
            "gbatch",
            "start",
            "data/vcf",
            "gwas-run",
            "-j",
            "4",
            "--retry-budget",
            "2",
            "--",
            "plink",
            "--vcf",
            "{input}",
        ]);
        match cli.command {
            Command::Start {
                input,
                session,
                concurrency,
                retry_budget,
                timeout,
                pattern,
                command,
            } => {
                assert_eq!(input, PathBuf::from("data/vcf"));
                assert_eq!(session, "gwas-run");
                assert_eq!(concurrency, Some(4));
                assert_eq!(retry_budget, Some(2));
                assert!(timeout.is_none());
                assert!(pattern.is_none());
                assert_eq!(command, vec!["plink", "--vcf", "{input}"]);
            }
            _ => panic!("expected Start command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "gbatch",
            "--state-dir",
            "/tmp/state",
            "--verbose",
            "status",
            "s1",
            "--json",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
        assert!(matches!(cli.command, Command::Status { json: true, .. }));
    }

    #[test]
    fn cli_parses_logs_subcommand() {
        let cli = Cli::parse_from(["gbatch", "logs", "s1", "chr01", "--stderr", "-n", "5"]);
        match cli.command {
            Command::Logs {
                session,
                key,
                stderr,
                lines,
            } => {
                assert_eq!(session, "s1");
                assert_eq!(key, "chr01");
                assert!(stderr);
                assert_eq!(lines, 5);
            }
            _ => panic!("expected Logs command"),
        }
    }

    #[test]
    fn cli_rejects_missing_session() {
        assert!(Cli::try_parse_from(["gbatch", "resume"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
