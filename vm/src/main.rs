use clap::Parser;
use std::path::PathBuf;
use tracing_log::log::debug;
use valka_runtime::VmConfig;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    #[arg(
        short = 'c',
        long = "classpath",
        visible_alias = "cp",
        value_delimiter = ':',
        help = "Classpath entries (directories); use ':' as separator"
    )]
    pub class_path: Vec<PathBuf>,
    #[arg(
        short = 'b',
        long = "bootclasspath",
        value_delimiter = ':',
        help = "Boot classpath entries searched for java/* classes"
    )]
    pub boot_class_path: Vec<PathBuf>,
    #[arg(
        long = "heap-size",
        default_value_t = 4 * 1024 * 1024,
        help = "Maximum heap size in bytes (at least the 32 KiB CLDC floor)"
    )]
    pub heap_size: usize,
    #[arg(
        long = "stack-depth",
        default_value_t = 512,
        help = "Maximum interpreter frame depth per thread"
    )]
    pub stack_depth: usize,
    #[arg(long = "no-finalizer", help = "Do not start the finalizer thread")]
    pub no_finalizer: bool,
    #[arg(help = "Main class, as com.example.Main or com/example/Main")]
    pub main_class: String,
    #[arg(trailing_var_arg = true, help = "Arguments passed to main")]
    pub main_args: Vec<String>,
}

fn create_vm_configuration(mut args: Args) -> VmConfig {
    if args.class_path.is_empty() {
        if let Ok(current_dir) = std::env::current_dir() {
            args.class_path.push(current_dir);
        }
    }
    VmConfig {
        main_class: args.main_class.replace('.', "/"),
        main_args: args.main_args,
        class_path: args.class_path,
        boot_class_path: args.boot_class_path,
        preloaded_classes: Vec::new(),
        heap_size: args.heap_size,
        frame_stack_limit: args.stack_depth,
        enable_finalizer: !args.no_finalizer,
    }
}

#[hotpath::main]
fn main() {
    #[cfg(feature = "log-runtime-traces")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    debug!("provided command line arguments: {:?}", args);

    let config = create_vm_configuration(args);
    match valka_runtime::start(config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("valka: {}", e);
            std::process::exit(2);
        }
    }
}
