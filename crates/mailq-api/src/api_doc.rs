//! OpenAPI documentation.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use mailq_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mailq API",
        version = "0.1.0",
        description = "Durable email dispatch queue. Mail submitted to /send is stored, then delivered through the configured SMTP relay by a pool of workers with bounded retries."
    ),
    paths(
        handlers::send::send_mail,
        handlers::tasks::get_task,
        handlers::tasks::task_stats,
        handlers::tasks::retry_task,
    ),
    components(
        schemas(
            models::MailRequest,
            models::TaskResponse,
            models::TaskStats,
            models::TaskStatus,
            handlers::send::SendResponse,
            error::ErrorResponse,
        )
    ),
    tags(
        (name = "mail", description = "Mail intake"),
        (name = "tasks", description = "Queue inspection and dead task recovery")
    )
)]
pub struct ApiDoc;
