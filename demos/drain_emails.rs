use pressq::{
    AppContext, Job, JobContext, JobRegistry, ManualClock, PressqError, Queue, QueueOptions,
    Result, async_trait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct SendOtp {
    email: String,
    code: String,
}

#[async_trait]
impl Job for SendOtp {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        if let Some(app) = ctx.app::<AppState>() {
            app.mailer.send(&self.email, &format!("Your code is {}", self.code))?;
        }
        Ok(())
    }

    fn name() -> &'static str {
        "send_otp"
    }

    fn queue_name() -> &'static str {
        "emails"
    }
}

struct AppState {
    mailer: Mailer,
}

impl AppContext for AppState {}

struct Mailer {
    smtp_up: bool,
}

impl Mailer {
    fn send(&self, to: &str, body: &str) -> Result<()> {
        if !self.smtp_up {
            return Err(anyhow::anyhow!("smtp down").into());
        }
        println!("[mail] to={to} body={body:?}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pressq=debug".into()),
        )
        .init();

    // Simulated time lets the demo skip the two-minute retry wait.
    let clock = ManualClock::starting_now();
    let queue = Arc::new(Queue::in_memory(Arc::new(clock.clone()), QueueOptions::default()));

    queue
        .enqueue(&SendOtp {
            email: "a@example.com".into(),
            code: "4711".into(),
        })
        .await?;
    queue
        .push("emails", "login_alert", &serde_json::json!({"user": 7}), 5)
        .await?;

    let mut registry = JobRegistry::new();
    registry.register::<SendOtp>();
    registry.register_fn("login_alert", |payload, ctx| async move {
        println!("[alert] user={} queue={}", payload["user"], ctx.queue_name);
        Ok::<_, PressqError>(())
    });
    let registry = Arc::new(registry);

    let down = pressq::Drainer::new(Arc::clone(&queue), Arc::clone(&registry))
        .with_app_context(Arc::new(AppState {
            mailer: Mailer { smtp_up: false },
        }));
    let report = down.drain("emails", 10, Duration::from_millis(10)).await?;
    println!("[drain] smtp down: {report:?}");

    clock.advance(Duration::from_secs(120));

    let up = pressq::Drainer::new(Arc::clone(&queue), registry).with_app_context(Arc::new(AppState {
        mailer: Mailer { smtp_up: true },
    }));
    let report = up.drain("emails", 10, Duration::from_millis(10)).await?;
    println!("[drain] smtp up: {report:?}");

    println!("[stats] {:?}", queue.stats("emails").await?);
    Ok(())
}
