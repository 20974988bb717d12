//! opflow CLI Entry Point
//!
//! Runs a built-in checkout operation against attributes given on the
//! command line, and prints the tagged result.
//!
//! # Usage
//!
//! ```bash
//! # Successful checkout
//! opflow email=ana@example.com 'items=[10, 25]'
//!
//! # Validation failure (blank email)
//! opflow email= 'items=[10]'
//!
//! # Declined charge, with the step trace
//! opflow email=ana@example.com 'items=[900, 400]' --trace
//!
//! # Load engine settings from YAML and re-raise runtime errors
//! opflow --config opflow.yaml --strict email=ana@example.com 'items=[-50]'
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};

use colored::Colorize;
use log::{error, info};
use serde_json::{json, Value};

use opflow::config::{self, Config};
use opflow::operation::Payload;
use opflow::{Attributes, Context, FlowResult, Operation, ResultKind, Step, StepError, Validations};
use opflow::{APP_NAME, VERSION};

/// Largest total the demo payment gateway accepts.
const CHARGE_LIMIT: i64 = 1000;

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<String>,
    strict: bool,
    trace: bool,
    verbose: bool,
    attributes: Attributes,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Operations with tagged results");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: opflow [OPTIONS] [KEY=VALUE]...");
    println!();
    println!("Runs the built-in Checkout operation:");
    println!("  validate -> price -> in_transaction[reserve, charge] -> receipt");
    println!();
    println!("Arguments:");
    println!("  [KEY=VALUE]         Attribute; VALUE is parsed as JSON, else taken as a string");
    println!();
    println!("Options:");
    println!("  --config PATH       Load engine configuration from a YAML file");
    println!("  --strict            Re-raise runtime step errors");
    println!("  --trace             Print the executed steps");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  opflow email=ana@example.com 'items=[10, 25]'");
    println!("  opflow email=ana@example.com 'items=[900, 400]' --trace");
}

/// Parses a `key=value` argument into an attribute entry.
fn parse_attribute(arg: &str) -> Result<(String, Value), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got: {}", arg))?;
    if !opflow::operation::is_symbolic_key(key) {
        return Err(format!("Invalid attribute name: {}", key));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Parses command-line arguments into CliOptions.
fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--strict" => options.strict = true,
            "--trace" => options.trace = true,
            "--verbose" | "-v" => options.verbose = true,
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                options.config_path = Some(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                let (key, value) = parse_attribute(arg)?;
                options.attributes.insert(key, value);
            }
        }
        i += 1;
    }

    Ok(options)
}

fn items_total(attrs: &Attributes) -> i64 {
    attrs
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).sum())
        .unwrap_or(0)
}

fn price(ctx: &Context, attrs: &Attributes) -> Result<FlowResult, StepError> {
    let total = items_total(attrs);
    let count = attrs.get("items").and_then(Value::as_array).map_or(0, Vec::len);
    info!("Priced {} items at {}", count, total);
    Ok(ctx.success(json!({ "total": total })))
}

fn reserve(ctx: &Context, _: &Attributes) -> Result<FlowResult, StepError> {
    static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(1);
    let reservation = format!("R-{:04}", NEXT_RESERVATION.fetch_add(1, Ordering::Relaxed));
    Ok(ctx.success_tagged(&["reserved"], json!({ "reservation": reservation })))
}

fn charge(ctx: &Context, attrs: &Attributes) -> Result<FlowResult, StepError> {
    let total = attrs.get("total").and_then(Value::as_i64).unwrap_or(0);
    if total < 0 {
        return Err(format!("payment gateway rejected negative amount {}", total).into());
    }
    if total > CHARGE_LIMIT {
        return Ok(ctx.failure_tagged(&["declined"], json!({ "limit": CHARGE_LIMIT, "total": total })));
    }
    Ok(ctx.success_tagged(&["charged"], json!({ "charged": total })))
}

fn receipt(ctx: &Context, attrs: &Attributes) -> Result<FlowResult, StepError> {
    Ok(ctx.success_tagged(
        &["receipt"],
        json!({
            "email": attrs.get("email"),
            "items": ctx.initial_attributes().get("items"),
            "total": attrs.get("total"),
            "reservation": attrs.get("reservation"),
        }),
    ))
}

/// Builds the demo checkout operation.
fn checkout() -> Result<Operation, opflow::FlowError> {
    Operation::builder("Checkout")
        .attributes(["email", "items"])
        .transient_attributes(["total", "reservation", "charged"])
        .validator(
            Validations::new()
                .presence("email")
                .presence("items")
                .rule("items", "must be a list of amounts", |value| {
                    value.and_then(Value::as_array).map_or(false, |items| {
                        items.iter().all(Value::is_i64)
                    })
                }),
        )
        .step("price", &["items"], price)
        .step("reserve", &["items"], reserve)
        .step("charge", &["total"], charge)
        .step("receipt", &["email", "total"], receipt)
        .group("in_transaction", &["total"], |ctx, _, cont| {
            info!("BEGIN transaction for {} ({} steps)", ctx.operation(), cont.steps().len());
            match cont.resume() {
                Some(result) if result.is_success() => info!("COMMIT"),
                _ => info!("ROLLBACK"),
            }
            Ok(())
        })
        .flow([
            Step::named("price"),
            Step::group("in_transaction", ["reserve", "charge"]),
            Step::named("receipt"),
        ])
        .build()
}

/// Prints a result with a colored outcome line.
fn print_result(result: FlowResult) {
    let label = match result.kind() {
        ResultKind::Ok => "SUCCESS".green().bold(),
        ResultKind::Failure => "FAILURE".yellow().bold(),
        ResultKind::Exception => "EXCEPTION".red().bold(),
    };
    println!();
    println!("{} [{}]", label, result.ids().join(", "));

    match result.into_payload() {
        Payload::Value(value) => match serde_json::to_string_pretty(&value) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => println!("<unprintable value: {}>", e),
        },
        Payload::Exception(exception) => println!("{}", exception.to_string().red()),
    }
}

/// Names the declared attributes when a call was rejected for its input.
fn print_attribute_hint(error: &opflow::FlowError, operation: &Operation) {
    if error.is_attribute_error() {
        eprintln!(
            "{} accepts: {}",
            operation.name(),
            operation.schema().attribute_names().join(", ")
        );
    }
}

/// Main application entry point. Returns true when the checkout succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(options.verbose);

    // Print banner
    print_banner();

    // Load configuration
    let mut settings = match &options.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if options.strict {
        settings.strict = true;
    }
    settings.add_error_handler(|result| {
        if let Some(exception) = result.exception_value() {
            error!("Error handler: {}", exception);
        }
    });
    config::configure(|global| *global = settings);

    let operation = checkout()?;
    info!(
        "Calling {} with {} attributes",
        operation.name(),
        options.attributes.len()
    );

    let outcome = if options.trace {
        operation
            .call_traced(&config::current(), options.attributes)
            .map(|(result, trace)| {
                println!();
                println!("Executed steps:");
                print!("{}", trace.summary());
                result
            })
    } else {
        operation.call(options.attributes)
    };
    let result = outcome.map_err(|e| {
        print_attribute_hint(&e, &operation);
        e
    })?;

    let succeeded = result.is_success();
    print_result(result);
    Ok(succeeded)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}
