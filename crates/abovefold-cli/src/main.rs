//! Abovefold CLI: extract critical-path CSS from a document.

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use serde_json::{Map, Value};

use abovefold::{coerce_into, ChromiumRenderer, Critical, Options};

#[derive(Parser, Debug)]
#[command(
    name = "abovefold",
    about = "Extract and inline critical-path CSS from HTML",
    version
)]
struct Cli {
    /// HTML file or URL. Read from stdin when omitted.
    input: Option<String>,

    /// Base directory (or URL) documents and assets are resolved against.
    #[arg(short, long)]
    base: Option<String>,

    /// Stylesheets to use instead of the ones the document references.
    #[arg(short, long)]
    css: Vec<String>,

    /// Viewport width.
    #[arg(short, long)]
    width: Option<u32>,

    /// Viewport height.
    #[arg(short = 'H', long)]
    height: Option<u32>,

    /// Viewports as WIDTHxHEIGHT, comma separated or repeated.
    #[arg(short, long)]
    dimensions: Vec<String>,

    /// Minify the critical CSS (default).
    #[arg(long)]
    minify: bool,

    /// Pretty-print the critical CSS.
    #[arg(long)]
    no_minify: bool,

    /// Inline the critical CSS into the document and print the HTML.
    #[arg(short, long)]
    inline: bool,

    /// Rules to drop from the critical CSS, literal or /pattern/flags.
    #[arg(long)]
    ignore: Vec<String>,

    /// Remove the critical CSS from the stylesheets it came from.
    #[arg(short, long)]
    extract: bool,

    /// Embed small images as data URIs.
    #[arg(long)]
    inline_images: bool,

    /// Prefix for rewritten stylesheet hrefs when inlining.
    #[arg(long)]
    path_prefix: Option<String>,

    /// Output file(s): .html for the document, then critical and
    /// uncritical CSS.
    #[arg(short, long)]
    target: Vec<String>,

    /// Maximum viewports rendered at once.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Basic-auth user.
    #[arg(long)]
    user: Option<String>,

    /// Basic-auth password.
    #[arg(long)]
    pass: Option<String>,

    /// User agent for requests and rendering.
    #[arg(long)]
    user_agent: Option<String>,

    /// Fail when the document has no usable CSS.
    #[arg(long)]
    strict: bool,

    /// Extra directories or URLs searched for assets.
    #[arg(long)]
    asset_paths: Vec<String>,

    /// Per-viewport render timeout in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Cli {
    /// Field/value pairs in option-table order.
    fn fields(&self) -> Vec<(&'static str, Vec<String>)> {
        let mut fields = Vec::new();
        let mut push = |name: &'static str, values: Vec<String>| {
            if !values.is_empty() {
                fields.push((name, values));
            }
        };
        let one = |value: Option<String>| value.into_iter().collect::<Vec<_>>();
        let flag = |set: bool| if set { vec!["true".to_string()] } else { Vec::new() };

        push("base", one(self.base.clone()));
        push("css", self.css.clone());
        push("width", one(self.width.map(|w| w.to_string())));
        push("height", one(self.height.map(|h| h.to_string())));
        push("dimensions", self.dimensions.clone());
        if self.no_minify {
            push("minify", vec!["false".into()]);
        } else if self.minify {
            push("minify", vec!["true".into()]);
        }
        push("inline", flag(self.inline));
        if self.inline {
            push("inline.basePath", one(self.path_prefix.clone()));
        }
        push("ignore", self.ignore.clone());
        push("extract", flag(self.extract));
        push("inlineImages", flag(self.inline_images));
        push("target", self.target.clone());
        push("concurrency", one(self.concurrency.map(|c| c.to_string())));
        push("user", one(self.user.clone()));
        push("pass", one(self.pass.clone()));
        push("userAgent", one(self.user_agent.clone()));
        push("strict", flag(self.strict));
        push("assetPaths", self.asset_paths.clone());
        push("renderer.timeout", one(self.timeout.map(|t| t.to_string())));
        fields
    }

    /// Options for one run. `stdin` holds the document when no input was
    /// given.
    fn options(&self, stdin: Option<String>) -> anyhow::Result<Options> {
        let mut map = Map::new();
        match (&self.input, stdin) {
            (Some(input), _) => {
                map.insert("src".into(), Value::String(input.clone()));
            }
            (None, Some(html)) => {
                map.insert("html".into(), Value::String(html));
            }
            (None, None) => anyhow::bail!("no input: pass an HTML file or URL, or pipe HTML on stdin"),
        }
        for (field, values) in self.fields() {
            coerce_into(&mut map, field, &values)?;
        }
        Ok(Options::from_json(Value::Object(map))?)
    }
}

fn read_stdin() -> anyhow::Result<Option<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut html = String::new();
    stdin.read_to_string(&mut html)?;
    Ok((!html.trim().is_empty()).then_some(html))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let stdin = if cli.input.is_none() {
        read_stdin()?
    } else {
        None
    };
    let options = cli.options(stdin)?;
    let print_html = options.inline.is_some();
    let has_target = !options.target.is_empty();

    let renderer = ChromiumRenderer::launch().await?;
    let result = Critical::new(Arc::new(renderer)).generate(options).await?;

    if !has_target {
        let mut stdout = std::io::stdout().lock();
        if print_html {
            stdout.write_all(result.html.as_bytes())?;
        } else {
            stdout.write_all(result.css.as_bytes())?;
        }
        stdout.flush()?;
    }
    Ok(())
}

/// Print `message` and the usage line to stderr, then exit 1.
fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    eprintln!();
    eprintln!("{}", Cli::command().render_usage());
    std::process::exit(1);
}

/// Parse arguments. `Ok(None)` means clap already answered a help or
/// version request.
fn parse_args<I, T>(args: I) -> Result<Option<Cli>, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            Ok(None)
        }
        Err(e) => {
            // First line only; the usage line is printed separately.
            let rendered = e.to_string();
            let message = rendered.lines().next().unwrap_or_default();
            Err(message.trim_start_matches("error: ").to_string())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match parse_args(std::env::args_os()) {
        Ok(Some(cli)) => cli,
        Ok(None) => return,
        Err(message) => fail(&message),
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        fail(&format!("{e:#}"));
    }
}
