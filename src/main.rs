//! Photo Indexer CLI
//!
//! Catalogs photo collections through the background scan coordinator.

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use photo_indexer::{
    CatalogDatabase, CollectionScannerFactory, InitOutcome, ProgressReporter, ScanConfig,
    ScanCoordinator, ScanError, ScanErrorKind,
};

const ABOUT: &str = r#"
Photo Indexer - 照片库索引工具

使用示例:
  photo_indexer init -r /photos                     初始化数据库并登记相册根目录
  photo_indexer scan -r /photos                     完整扫描照片库
  photo_indexer scan -r /photos --defer             先扫描相册，稍后处理新文件
  photo_indexer scan -r /photos --json              JSON格式输出
  photo_indexer rescan -r /photos /photos/2024      只扫描指定路径
  photo_indexer rehash -r /photos -d catalog.db     重新计算文件哈希
"#;

/// Minimum interval between per-file progress lines
const PROGRESS_INTERVAL_MS: u64 = 500;

/// Photo collection indexer
#[derive(Parser)]
#[command(name = "photo_indexer")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// 显示帮助信息
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help, global = true)]
    help: Option<bool>,
}

/// Options shared by every subcommand
#[derive(Args)]
struct CatalogArgs {
    /// 相册根目录（可指定多个）
    #[arg(short = 'r', long = "root", help = "相册根目录，可多次指定")]
    roots: Vec<PathBuf>,

    /// 数据库文件路径
    #[arg(short = 'd', long, help = "SQLite数据库文件路径")]
    db: Option<PathBuf>,

    /// JSON 配置文件
    #[arg(short = 'c', long, help = "JSON格式的扫描配置文件")]
    config: Option<PathBuf>,

    /// 输出进度信息
    #[arg(long, help = "以JSON行格式向stderr输出进度")]
    progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 初始化数据库
    #[command(about = "创建或升级数据库并登记相册根目录")]
    Init {
        #[command(flatten)]
        catalog: CatalogArgs,
    },

    /// 完整扫描
    #[command(about = "扫描所有相册根目录")]
    Scan {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// 推迟新文件的扫描
        #[arg(long, help = "先完成相册扫描，再处理新文件")]
        defer: bool,

        /// 以 JSON 格式输出结果
        #[arg(long, help = "输出JSON格式的扫描结果")]
        json: bool,
    },

    /// 扫描单个路径
    #[command(about = "只扫描指定的相册或文件")]
    Rescan {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// 需要扫描的路径
        path: PathBuf,
    },

    /// 重新计算哈希
    #[command(about = "重新计算缺失或不完整的文件哈希")]
    Rehash {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
}

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        // 没有子命令时显示帮助
        println!("{}", ABOUT);
        println!("使用 'photo_indexer --help' 查看完整帮助信息");
        return;
    };

    if let Err(e) = run(command) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<(), ScanError> {
    match command {
        Commands::Init { catalog } => with_coordinator(&catalog, |_, config| {
            info!("Catalog ready at {}", config.catalog_path().display());
            Ok(())
        }),
        Commands::Scan {
            catalog,
            defer,
            json,
        } => with_coordinator(&catalog, |coordinator, config| {
            coordinator.scan_everything(defer);
            if defer {
                coordinator.allow_deferred_scan();
                coordinator.wait_until_idle();
            }
            print_summary(config, json)
        }),
        Commands::Rescan { catalog, path } => with_coordinator(&catalog, |coordinator, _| {
            info!("Scanning {}", path.display());
            coordinator.schedule_scan(&path);
            coordinator.wait_until_idle();
            Ok(())
        }),
        Commands::Rehash { catalog } => with_coordinator(&catalog, |coordinator, _| {
            coordinator.update_unique_hash();
            Ok(())
        }),
    }
}

fn build_config(args: &CatalogArgs) -> Result<ScanConfig, ScanError> {
    let mut config = match &args.config {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };
    if !args.roots.is_empty() {
        config.roots = args.roots.clone();
    }
    if let Some(db) = &args.db {
        config.db_path = Some(db.clone());
    }
    if config.roots.is_empty() {
        return Err(ScanError::new(
            ScanErrorKind::InvalidPath,
            None,
            "no album roots given, use -r or a config file",
        ));
    }
    Ok(config)
}

/// Start a coordinator, prepare the catalog, run `action`, then shut down
fn with_coordinator<F>(args: &CatalogArgs, action: F) -> Result<(), ScanError>
where
    F: FnOnce(&ScanCoordinator, &ScanConfig) -> Result<(), ScanError>,
{
    let config = build_config(args)?;
    info!("Roots: {:?}", config.roots);
    info!("Catalog: {}", config.catalog_path().display());

    let factory = Arc::new(CollectionScannerFactory::new(config.clone()));
    let coordinator = ScanCoordinator::with_defaults(factory)?;

    let rx = coordinator.notifications();
    let progress = args.progress;
    let reporter = thread::Builder::new()
        .name("progress-reporter".to_string())
        .spawn(move || ProgressReporter::new(progress, PROGRESS_INTERVAL_MS).drain(&rx))
        .map_err(|e| ScanError::io_error(None, e.to_string()))?;

    let result = match coordinator.initialize_database() {
        InitOutcome::AbortImmediately => Err(ScanError::schema_error(
            "catalog cannot be used by this version",
        )),
        InitOutcome::ContinueDegraded => {
            warn!("Catalog initialization incomplete, continuing");
            action(&coordinator, &config)
        }
        InitOutcome::Success => action(&coordinator, &config),
    };

    // The reporter stops once the worker and its senders are gone
    drop(coordinator);
    if reporter.join().is_err() {
        warn!("Progress reporter panicked");
    }
    result
}

fn print_summary(config: &ScanConfig, json: bool) -> Result<(), ScanError> {
    let db = CatalogDatabase::open(&config.catalog_path())?;
    let albums = db.album_count()?;
    let items = db.item_count()?;
    let statuses = db.get_status_counts()?;
    let deleted = db.get_deleted_items()?.len();

    if json {
        let summary = serde_json::json!({
            "albums": albums,
            "items": items,
            "statuses": statuses,
            "deleted": deleted,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => warn!("Cannot serialize summary: {}", e),
        }
    } else {
        println!("Scan completed:");
        println!("  Albums: {}", albums);
        println!("  Items: {}", items);
        let mut statuses: Vec<_> = statuses.into_iter().collect();
        statuses.sort();
        for (status, count) in statuses {
            println!("  {}: {}", status, count);
        }
        println!("  Deleted: {}", deleted);
    }
    Ok(())
}
