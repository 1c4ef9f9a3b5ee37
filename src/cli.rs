use std::io::{self, Write};

use anyhow::{anyhow, bail, Context};
use bmidb::parser::{self, Command};
use bmidb::server::{ApiError, RecordView, SubmitForm};
use clap::Parser;
use reqwest::StatusCode;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Interactive client for a bmidb server", long_about = None)]
struct Args {
    /// Server address.
    #[clap(long, default_value = "127.0.0.1:5000")]
    host: String,
}

struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(host: &str) -> Self {
        Self {
            base: format!("http://{}", host),
            http: reqwest::Client::new(),
        }
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let resp = self.http.get(format!("{}/", self.base)).send().await?;
        if !resp.status().is_success() {
            bail!("server answered {}", resp.status());
        }
        Ok(())
    }

    async fn calc(&self, weight: u32, height: u32) -> anyhow::Result<RecordView> {
        let form = SubmitForm {
            weight: weight.to_string(),
            height: height.to_string(),
        };
        let resp = self
            .http
            .post(format!("{}/api/records", self.base))
            .json(&form)
            .send()
            .await?;

        match resp.status() {
            StatusCode::CREATED => Ok(resp.json().await?),
            status => Err(api_error(status, resp).await),
        }
    }

    async fn show(&self, id: u64) -> anyhow::Result<Option<RecordView>> {
        let resp = self
            .http
            .get(format!("{}/api/records/{}", self.base, id))
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(api_error(status, resp).await),
        }
    }
}

async fn api_error(status: StatusCode, resp: reqwest::Response) -> anyhow::Error {
    match resp.json::<ApiError>().await {
        Ok(body) => anyhow!("{} ({})", body.error, status),
        Err(_) => anyhow!("server answered {}", status),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let client = ApiClient::new(&args.host);

    print_banner();

    if let Err(e) = runtime.block_on(client.ping()) {
        println!("[\u{2717}] Could not reach server at {}: {}", args.host, e);
        println!("    Make sure 'bmidb' is running in another terminal.");
        return Ok(());
    }
    println!("[\u{2713}] Connected to bmidb at {}!", args.host);
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");

    let stdin = io::stdin();
    let mut buffer = String::new();

    loop {
        print!("bmidb> ");
        io::stdout().flush()?;
        buffer.clear();

        if stdin.read_line(&mut buffer)? == 0 { break; }
        if buffer.trim().is_empty() { continue; }

        match parser::parse_command(&buffer) {
            Ok(Command::Exit) => break,
            Ok(cmd) => {
                if let Err(e) = execute_command(&runtime, &client, cmd) {
                    println!("[\u{26a0}\u{fe0f} Error] {}", e);
                }
            }
            Err(e) => {
                println!("[\u{2717} Syntax Error] {}", e);
                if buffer.trim_start().to_uppercase().starts_with("CALC") {
                    println!("    \u{2139}\u{fe0f}  Hint: weight and height are whole numbers: CALC 70 170");
                }
            }
        }
    }
    Ok(())
}

fn print_banner() {
    println!("\n==================================================");
    println!("   bmidb CLI - permanent BMI results");
    println!("==================================================\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. CALC:  CALC <weight> <height>   (alias: BMI)");
    println!("2. SHOW:  SHOW <id>                (alias: GET)");
    println!("3. EXIT:  Quit\n");
}

fn execute_command(runtime: &Runtime, client: &ApiClient, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Help => print_help(),
        Command::Calc { weight, height } => {
            let view = runtime.block_on(client.calc(weight, height))?;
            println!("[\u{2713} OK] Result #{}: {}", view.id, view.value);
            println!("    Share: {}{}", client.base, view.url);
        }
        Command::Show { id } => match runtime.block_on(client.show(id))? {
            Some(view) => println!("Result #{}: {}", view.id, view.value),
            None => println!("[\u{2717}] ID Not Found."),
        },
        Command::Exit => {}
    }
    Ok(())
}
