use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use civic_core::{
    Category, CategoryFilter, DepartmentDraft, MediaItem, MediaKind, Priority, Report, ReportDraft,
    ReportEdit, ReportStatus, Role, SessionUser, StatusFilter,
};
use civic_sync::{ReportLifecycleStore, StoreConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "civic-cli")]
#[command(about = "Citizen report lifecycle command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Submit a new report as the signed-in user.
    Submit {
        #[arg(long)]
        category: Category,
        #[arg(long)]
        description: String,
        #[arg(long)]
        location: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "Medium")]
        priority: Priority,
        #[arg(long)]
        contact: Option<String>,
        /// Image attachment uri; repeatable.
        #[arg(long = "image")]
        images: Vec<String>,
    },
    List {
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        #[arg(long, default_value = "all")]
        category: CategoryFilter,
        /// Only the signed-in user's reports.
        #[arg(long)]
        mine: bool,
    },
    Show {
        id: String,
    },
    Assign {
        id: String,
        department: String,
    },
    Status {
        id: String,
        status: ReportStatus,
        #[arg(long)]
        note: Option<String>,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
    },
    Delete {
        id: String,
    },
    Stats,
    Notifications {
        #[arg(long)]
        read_all: bool,
        #[arg(long)]
        read: Option<i64>,
    },
    Login {
        #[arg(long)]
        phone: String,
        #[arg(long)]
        uid: Option<String>,
        #[arg(long, default_value = "")]
        name: String,
    },
    Logout,
    /// Pull every remote report into the local collection.
    Refresh,
    Departments {
        #[command(subcommand)]
        action: DepartmentAction,
    },
}

#[derive(Debug, Subcommand)]
enum DepartmentAction {
    List,
    Add { name: String },
    Remove { id: String },
}

fn priority_tag(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low ",
        Priority::Medium => "med ",
        Priority::High => "HIGH",
    }
}

fn print_report_line(report: &Report) {
    println!(
        "{}  [{}] {:<22} {:<12} {}",
        report.id,
        priority_tag(report.priority),
        report.category.display_name(),
        report.status.display_label(),
        report.location
    );
}

fn print_report(report: &Report) {
    println!("id:          {}", report.id);
    println!("owner:       {}", report.user_id);
    println!("category:    {}", report.category.display_name());
    println!("title:       {}", report.title);
    println!("description: {}", report.description);
    println!("location:    {}", report.location);
    println!("status:      {}", report.status.display_label());
    if let Some(department) = &report.department {
        println!("department:  {department}");
    }
    for media in &report.media {
        println!("media:       {}", media.uri);
    }
    println!("timeline:");
    for entry in &report.timeline {
        println!(
            "  {}  {:<12} {}",
            entry.date.format("%Y-%m-%d %H:%M"),
            entry.status.display_label(),
            entry.note
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,civic_sync=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::from_env();
    info!(data_dir = %config.data_dir.display(), remote = config.remote_url.is_some(), "starting civic-cli");

    let mut store = ReportLifecycleStore::from_config(config)?;
    store.initialize().await;
    store.settle_admin_check().await;

    match cli.command.unwrap_or(Commands::List {
        status: StatusFilter::All,
        category: CategoryFilter::All,
        mine: false,
    }) {
        Commands::Submit {
            category,
            description,
            location,
            title,
            priority,
            contact,
            images,
        } => {
            let owner = store
                .current_user()
                .and_then(SessionUser::report_owner_id)
                .context("sign in before submitting a report")?
                .to_string();
            let draft = ReportDraft {
                user_id: owner,
                category,
                title,
                description,
                location,
                priority,
                contact_info: contact,
                media: images
                    .into_iter()
                    .map(|uri| MediaItem {
                        uri,
                        kind: MediaKind::Image,
                    })
                    .collect(),
            };
            draft.validate()?;
            let id = store.add_report(draft).await?;
            println!("submitted report {id}");
        }
        Commands::List {
            status,
            category,
            mine,
        } => {
            let reports: Vec<&Report> = if mine {
                store.user_reports(None)
            } else {
                store.reports().iter().collect()
            };
            for report in reports
                .into_iter()
                .filter(|r| status.matches(r.status) && category.matches(r.category))
            {
                print_report_line(report);
            }
        }
        Commands::Show { id } => match store.report(&id) {
            Some(report) => print_report(report),
            None => println!("report {id} not found"),
        },
        Commands::Assign { id, department } => {
            if !store.assign_department(&id, &department).await {
                println!("report {id} not found");
            }
        }
        Commands::Status { id, status, note } => {
            if !store.update_report_status(&id, status, note).await {
                println!("report {id} not found");
            }
        }
        Commands::Edit {
            id,
            title,
            description,
            location,
            priority,
        } => {
            let edit = ReportEdit {
                title,
                description,
                location,
                priority,
                ..Default::default()
            };
            if !store.edit_report(&id, edit).await? {
                println!("report {id} not found");
            }
        }
        Commands::Delete { id } => {
            if !store.delete_report(&id).await? {
                println!("report {id} not found");
            }
        }
        Commands::Stats => {
            let stats = store.stats();
            println!(
                "total={} pending={} in_progress={} resolved={}",
                stats.total, stats.pending, stats.in_progress, stats.resolved
            );
            if store.current_user().is_some() {
                let mine = store.user_stats();
                println!(
                    "mine: total={} pending={} resolved={}",
                    mine.total, mine.pending, mine.resolved
                );
            }
            for (category, count) in store.department_stats() {
                println!("  {:<22} {count}", category.display_name());
            }
        }
        Commands::Notifications { read_all, read } => {
            if let Some(id) = read {
                store.mark_notification_as_read(id).await;
            }
            if read_all {
                store.mark_all_notifications_as_read().await;
            }
            for n in store.notifications() {
                println!(
                    "{} {} {} {} {}",
                    if n.read { " " } else { "*" },
                    n.id,
                    n.icon,
                    n.title_key,
                    n.report_id.as_deref().unwrap_or("")
                );
            }
            println!("{} unread", store.unread_count());
        }
        Commands::Login { phone, uid, name } => {
            store
                .login(SessionUser {
                    uid,
                    id: Some(phone.clone()),
                    phone,
                    name,
                    role: Role::Citizen,
                })
                .await;
            println!("signed in (admin: {})", store.is_admin());
        }
        Commands::Logout => store.logout().await,
        Commands::Refresh => {
            let fetched = store.refresh_all_reports().await?;
            println!("fetched {fetched} reports");
        }
        Commands::Departments { action } => {
            let admin = store.admin().clone();
            match action {
                DepartmentAction::List => {
                    for department in admin.list_departments().await? {
                        println!(
                            "{}  {:<20} {:<20} {}{}",
                            department.id,
                            department.name,
                            department.icon_name,
                            department.color,
                            if department.is_active { "" } else { " (inactive)" }
                        );
                    }
                }
                DepartmentAction::Add { name } => {
                    if name.trim().is_empty() {
                        bail!("department name cannot be empty");
                    }
                    let id = admin.add_department(&DepartmentDraft::from_name(name)).await?;
                    println!("added department {id}");
                }
                DepartmentAction::Remove { id } => {
                    admin.delete_department(&id).await?;
                    println!("removed department {id}");
                }
            }
        }
    }

    Ok(())
}
