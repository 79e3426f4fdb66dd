//! Reconcile loops for the two custom resources.
//!
//! They only translate resource changes into calls on the managers:
//! `CounterMeasure` into [`ActionManager`], `PrometheusSource` into
//! [`ProducerManager`]. Deletion runs through a finalizer.

pub mod countermeasure;
pub mod prometheus_source;

use crate::crds::{CounterMeasure, PrometheusSource};
use crate::error::{Error, Result};
use crate::manager::ActionManager;
use crate::producer::ProducerManager;
use crate::recorder::NoticeRecorder;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, Instrument};

pub const FINALIZER_NAME: &str = "countermeasure.io/cleanup";

const REQUEUE_AFTER_ERROR: Duration = Duration::from_secs(30);

/// Shared by both reconcile loops.
pub struct Context {
    pub client: Client,
    pub actions: ActionManager,
    pub producers: Arc<ProducerManager>,
    pub recorder: Arc<dyn NoticeRecorder>,
}

/// Watch scope: one namespace or the whole cluster.
fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

pub(crate) fn map_finalizer_error(e: finalizer::Error<Error>) -> Error {
    match e {
        finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => err,
        finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
            Error::KubeError(e)
        }
        finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    }
}

/// Configuration errors wait for the object to change; anything else is retried.
fn error_policy<K>(object: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    let name = object.meta().name.clone().unwrap_or_default();
    if err.is_config_error() {
        error!(error = %err, object = %name, "Reconciliation failed, waiting for a change");
        Action::await_change()
    } else {
        error!(error = %err, object = %name, "Reconciliation failed, requeueing");
        Action::requeue(REQUEUE_AFTER_ERROR)
    }
}

async fn drain<S, T, E>(results: S, kind: &'static str)
where
    S: futures::Stream<Item = std::result::Result<T, E>>,
    T: Debug,
    E: Debug,
{
    results
        .for_each(|result| {
            let span = tracing::info_span!("reconciliation_result", kind);
            async move {
                match result {
                    Ok(resource) => {
                        info!(resource = ?resource, "{kind} reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "{kind} reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;
}

/// Runs both controllers until `cancel` fires.
#[instrument(skip(context, cancel))]
pub async fn run_controllers(
    context: Arc<Context>,
    namespace: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting CounterMeasure and PrometheusSource controllers");
    let watcher_config = Config::default().any_semantic();

    let policies: Api<CounterMeasure> = api(&context.client, namespace.as_deref());
    let sources: Api<PrometheusSource> = api(&context.client, namespace.as_deref());

    let policy_controller = drain(
        Controller::new(policies, watcher_config.clone()).run(
            countermeasure::reconcile,
            error_policy,
            context.clone(),
        ),
        "CounterMeasure",
    );
    let source_controller = drain(
        Controller::new(sources, watcher_config).run(
            prometheus_source::reconcile,
            error_policy,
            context,
        ),
        "PrometheusSource",
    );

    tokio::select! {
        () = async { tokio::join!(policy_controller, source_controller); } => {}
        () = cancel.cancelled() => {}
    }

    info!("Controllers shutting down");
    Ok(())
}
