//! Interactive query shell.
//!
//! Reads one shorthand query per line, prints the compiled SQL, the row
//! count and the first `query.display_rows` rows. `exit` or `quit` (or end
//! of input) leaves the loop. Syntax and database errors are printed and
//! the loop continues.

use anyhow::Result;
use sqlx::SqlitePool;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::db;
use crate::search::{self, render_record};

const PROMPT: &str = "civic> ";

/// `civic shell`: run the loop on stdin/stdout.
pub async fn run_shell(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stdin = BufReader::new(tokio::io::stdin());
    let result = shell_loop(&pool, config, stdin, &mut std::io::stdout()).await;
    pool.close().await;
    result.map(|_| ())
}

/// Drive the shell over arbitrary input and output. Returns the number of
/// queries executed.
pub async fn shell_loop<R, W>(
    pool: &SqlitePool,
    config: &Config,
    input: R,
    out: &mut W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(
        out,
        "Enter a query (title:, email:, filter:, crm:, range:, or free text). Type 'exit' to quit."
    )?;

    let mut lines = input.lines();
    let mut executed = 0;

    loop {
        write!(out, "{}", PROMPT)?;
        out.flush()?;

        let Some(line) = lines.next_line().await? else {
            writeln!(out)?;
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }

        match search::run_query(pool, line, config.query.row_limit).await {
            Ok(outcome) => {
                executed += 1;
                writeln!(out, "{}", outcome.compiled.explain())?;
                writeln!(out, "Returned {} rows.", outcome.records.len())?;
                for (i, rec) in outcome
                    .records
                    .iter()
                    .take(config.query.display_rows)
                    .enumerate()
                {
                    write!(out, "{}", render_record(i + 1, rec))?;
                }
                if outcome.records.len() > config.query.display_rows {
                    writeln!(
                        out,
                        "... {} more",
                        outcome.records.len() - config.query.display_rows
                    )?;
                }
            }
            Err(e) => {
                tracing::debug!(query = line, error = %e, "shell query failed");
                writeln!(out, "Error: {}", e)?;
            }
        }
    }

    Ok(executed)
}
