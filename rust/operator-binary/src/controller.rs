//! Drives the [`syncer`]s from watches on both clusters.
//!
//! Every kind runs two controllers. The virtual-keyed one owns every pair whose virtual object
//! exists and is also triggered by changes of the host copy. A controller only reconciles objects
//! that exist in its own cluster, so a host-keyed controller handles host objects whose virtual
//! counterpart is missing (host-created objects and copies of deleted virtual objects).
//! [`reconcile_host`] leaves everything else alone, so no pair is synced by two passes at once.

use std::{future::Future, pin::pin, sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{future, StreamExt};
use stackable_operator::{
    k8s_openapi::api::{core::v1::Secret, networking::v1::Ingress},
    kube::{
        self,
        api::Api,
        runtime::{
            controller::{self, Action},
            reflector::{self, ObjectRef},
            watcher, Controller, WatchStreamExt,
        },
        Resource,
    },
    logging::controller::ReconcilerError,
};
use tracing::{debug, error, info, warn};

use crate::{
    external_crd::cert_manager::{Certificate, Issuer},
    hooks::{self, IngressHook},
    ingress::{IngressIndex, IngressSource},
    plane::KubePlane,
    syncer::{
        self, reconcile_host, reconcile_virtual, CertificateSyncer, IssuerSyncer, KubeEventSink,
        SecretSyncer, SyncContext, Syncer,
    },
    translate::{self, Identity, IdentityMapper},
    APP_NAME,
};

const FULL_CONTROLLER_NAME: &str = concatcp!("sync.", APP_NAME);

/// Reconciliations in flight per controller.
const CONCURRENCY: usize = 16;

#[derive(Clone, Copy, Debug)]
enum Side {
    Virtual,
    Host,
}

struct Ctx<S> {
    syncer: S,
    side: Side,
    sync: Arc<SyncContext<KubePlane>>,
}

struct HookCtx {
    hook: IngressHook,
    sync: Arc<SyncContext<KubePlane>>,
}

pub struct Clients {
    pub virtual_client: kube::Client,
    pub host_client: kube::Client,
    pub field_manager: String,
}

/// Runs all controllers until the process is asked to shut down.
pub async fn start(clients: Clients, mapper: IdentityMapper) {
    let host_namespace = mapper.host_namespace().to_string();
    let virtual_client = clients.virtual_client;
    let host_client = clients.host_client;

    let (ingress_store, ingress_writer) = reflector::store::<Ingress>();
    let ingress_reflector = watcher(
        Api::<Ingress>::all(virtual_client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .reflect(ingress_writer)
    .applied_objects()
    .for_each(|ingress| {
        if let Err(err) = ingress {
            warn!(
                error = &err as &dyn std::error::Error,
                "failed to watch virtual ingresses"
            );
        }
        future::ready(())
    });

    let ingress_source: Arc<dyn IngressSource> = Arc::new(ingress_store);
    let sync = Arc::new(SyncContext {
        virtual_plane: KubePlane::new(virtual_client.clone(), &clients.field_manager),
        host_plane: KubePlane::new(host_client.clone(), &clients.field_manager),
        mapper: mapper.clone(),
        ingresses: IngressIndex::new(ingress_source, mapper.clone()),
        events: Arc::new(KubeEventSink::new(
            virtual_client.clone(),
            FULL_CONTROLLER_NAME,
        )),
    });

    let virtual_certificates = Controller::new(
        Api::<Certificate>::all(virtual_client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<Certificate>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
        to_virtual_or_ingress::<Certificate>(&sync.ingresses),
    );
    let host_certificates = Controller::new(
        Api::<Certificate>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
    )
    .watches(
        Api::<Certificate>::all(virtual_client.clone()),
        watcher::Config::default(),
        to_host::<Certificate>(&mapper),
    )
    .watches(
        Api::<Ingress>::all(virtual_client.clone()),
        watcher::Config::default(),
        ingress_to_host::<Certificate>(&sync.ingresses),
    );

    let virtual_issuers = Controller::new(
        Api::<Issuer>::all(virtual_client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<Issuer>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
        to_virtual::<Issuer>,
    );
    let host_issuers = Controller::new(
        Api::<Issuer>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
    )
    .watches(
        Api::<Issuer>::all(virtual_client.clone()),
        watcher::Config::default(),
        to_host::<Issuer>(&mapper),
    );

    let virtual_secrets = Controller::new(
        Api::<Secret>::all(virtual_client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<Certificate>::all(virtual_client.clone()),
        watcher::Config::default(),
        certificate_secrets,
    )
    .watches(
        Api::<Issuer>::all(virtual_client.clone()),
        watcher::Config::default(),
        issuer_secrets,
    )
    .watches(
        Api::<Secret>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
        to_virtual_or_ingress::<Secret>(&sync.ingresses),
    )
    .watches(
        Api::<Certificate>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
        issued_virtual_secret(&mapper),
    );
    let host_secrets = Controller::new(
        Api::<Secret>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
    )
    .watches(
        Api::<Secret>::all(virtual_client.clone()),
        watcher::Config::default(),
        to_host::<Secret>(&mapper),
    )
    .watches(
        Api::<Certificate>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
        issued_host_secret,
    )
    .watches(
        Api::<Ingress>::all(virtual_client.clone()),
        watcher::Config::default(),
        ingress_to_host::<Secret>(&sync.ingresses),
    );

    let host_ingresses = Controller::new(
        Api::<Ingress>::namespaced(host_client.clone(), &host_namespace),
        watcher::Config::default(),
    )
    .watches(
        Api::<Ingress>::all(virtual_client.clone()),
        watcher::Config::default(),
        to_host::<Ingress>(&mapper),
    );

    let controllers = async {
        futures::join!(
            run(
                "certificate.virtual",
                virtual_certificates,
                CertificateSyncer,
                Side::Virtual,
                &sync
            ),
            run(
                "certificate.host",
                host_certificates,
                CertificateSyncer,
                Side::Host,
                &sync
            ),
            run(
                "issuer.virtual",
                virtual_issuers,
                IssuerSyncer,
                Side::Virtual,
                &sync
            ),
            run("issuer.host", host_issuers, IssuerSyncer, Side::Host, &sync),
            run(
                "secret.virtual",
                virtual_secrets,
                SecretSyncer,
                Side::Virtual,
                &sync
            ),
            run("secret.host", host_secrets, SecretSyncer, Side::Host, &sync),
            run_ingress_hook(host_ingresses, IngressHook::new(mapper.clone()), &sync),
        );
    };
    with_background(controllers, ingress_reflector).await;
}

/// Drives `background` alongside `main` and drops it once `main` is done.
async fn with_background<F: Future>(main: F, background: impl Future<Output = ()>) -> F::Output {
    let mut main = pin!(main);
    tokio::select! {
        output = &mut main => output,
        () = background => {
            warn!("background task ended early");
            main.await
        }
    }
}

fn object_ref<K: Resource<DynamicType = ()>>(identity: &Identity) -> ObjectRef<K> {
    ObjectRef::new(&identity.name).within(&identity.namespace)
}

/// Maps a virtual object to its host copy.
fn to_host<K: Resource<DynamicType = ()> + 'static>(
    mapper: &IdentityMapper,
) -> impl Fn(K) -> Option<ObjectRef<K>> + Send + Sync + 'static {
    let mapper = mapper.clone();
    move |obj| Some(object_ref(&mapper.to_host(&Identity::from_meta(obj.meta()))))
}

/// Maps a host copy written by this plugin to its virtual object.
fn to_virtual<K: Resource<DynamicType = ()>>(host: K) -> Option<ObjectRef<K>> {
    translate::virtual_identity(host.meta()).map(|identity| object_ref(&identity))
}

/// Like [`to_virtual`], but also maps objects that ingress-shim created for a virtual Ingress.
fn to_virtual_or_ingress<K: Resource<DynamicType = ()> + 'static>(
    index: &IngressIndex,
) -> impl Fn(K) -> Option<ObjectRef<K>> + Send + Sync + 'static {
    let index = index.clone();
    move |host| {
        translate::virtual_identity(host.meta())
            .or_else(|| index.virtual_identity_for(host.meta().name.as_deref().unwrap_or_default()))
            .map(|identity| object_ref(&identity))
    }
}

/// Maps a virtual Ingress to the host Certificates (and their Secrets) that ingress-shim
/// creates for it.
fn ingress_to_host<K: Resource<DynamicType = ()> + 'static>(
    index: &IngressIndex,
) -> impl Fn(Ingress) -> Vec<ObjectRef<K>> + Send + Sync + 'static {
    let index = index.clone();
    move |ingress| {
        index
            .host_certificates(&ingress)
            .iter()
            .map(object_ref)
            .collect()
    }
}

/// Secrets a virtual Certificate reads or gets issued into, all in its own namespace.
fn certificate_secrets(certificate: Certificate) -> Vec<ObjectRef<Secret>> {
    let namespace = certificate.metadata.namespace.clone().unwrap_or_default();
    certificate
        .spec
        .referenced_secrets()
        .into_iter()
        .chain([certificate.spec.secret_name])
        .filter(|name| !name.is_empty())
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

/// Credential Secrets of a virtual Issuer.
fn issuer_secrets(issuer: Issuer) -> Vec<ObjectRef<Secret>> {
    let namespace = issuer.metadata.namespace.clone().unwrap_or_default();
    issuer
        .spec
        .referenced_secrets()
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

/// The host Secret that cert-manager issues a host Certificate into.
fn issued_host_secret(certificate: Certificate) -> Option<ObjectRef<Secret>> {
    let namespace = certificate.metadata.namespace.unwrap_or_default();
    (!certificate.spec.secret_name.is_empty())
        .then(|| ObjectRef::new(&certificate.spec.secret_name).within(&namespace))
}

/// The virtual Secret that receives what cert-manager issues for a forward-synced Certificate.
fn issued_virtual_secret(
    mapper: &IdentityMapper,
) -> impl Fn(Certificate) -> Option<ObjectRef<Secret>> + Send + Sync + 'static {
    let mapper = mapper.clone();
    move |certificate| {
        let owner = translate::virtual_identity(&certificate.metadata)?;
        let name = mapper.decode_host_name(&certificate.spec.secret_name, &owner.namespace)?;
        Some(object_ref(&Identity::new(owner.namespace, name)))
    }
}

async fn run<S: Syncer + 'static>(
    name: &'static str,
    controller: Controller<S::Object>,
    syncer: S,
    side: Side,
    sync: &Arc<SyncContext<KubePlane>>,
) {
    let ctx = Arc::new(Ctx {
        syncer,
        side,
        sync: sync.clone(),
    });
    controller
        .shutdown_on_signal()
        .run(reconcile::<S>, error_policy, ctx)
        .for_each_concurrent(CONCURRENCY, move |result| {
            report_reconciled(name, result);
            future::ready(())
        })
        .await;
}

async fn run_ingress_hook(
    controller: Controller<Ingress>,
    hook: IngressHook,
    sync: &Arc<SyncContext<KubePlane>>,
) {
    let ctx = Arc::new(HookCtx {
        hook,
        sync: sync.clone(),
    });
    controller
        .shutdown_on_signal()
        .run(reconcile_ingress, error_policy, ctx)
        .for_each_concurrent(CONCURRENCY, |result| {
            report_reconciled(IngressHook::NAME, result);
            future::ready(())
        })
        .await;
}

async fn reconcile<S: Syncer>(
    obj: Arc<S::Object>,
    ctx: Arc<Ctx<S>>,
) -> Result<Action, syncer::Error> {
    let identity = Identity::from_meta(obj.meta());
    let outcome = match ctx.side {
        Side::Virtual => reconcile_virtual(&ctx.syncer, &ctx.sync, &identity).await?,
        Side::Host => reconcile_host(&ctx.syncer, &ctx.sync, &identity).await?,
    };
    Ok(if outcome.needs_followup() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::await_change()
    })
}

/// Applies the ingress hook to host Ingresses that vcluster synced for this vcluster.
async fn reconcile_ingress(host: Arc<Ingress>, ctx: Arc<HookCtx>) -> Result<Action, hooks::Error> {
    if !ctx.sync.mapper.is_managed(&host.metadata) {
        return Ok(Action::await_change());
    }
    let Some(identity) = translate::virtual_identity(&host.metadata) else {
        return Ok(Action::await_change());
    };
    let Some(virtual_ingress) = ctx.sync.ingresses.virtual_ingress(&identity) else {
        debug!(ingress = %identity, "virtual ingress not seen yet");
        return Ok(Action::await_change());
    };
    if hooks::apply_to_host(&ctx.hook, &ctx.sync.host_plane, &host, &virtual_ingress).await? {
        info!(ingress = %identity, "translated issuer annotation of host ingress");
    }
    Ok(Action::await_change())
}

fn error_policy<K, E, C>(_obj: Arc<K>, _error: &E, _ctx: Arc<C>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

fn report_reconciled<K: Resource, E: ReconcilerError + 'static>(
    controller_name: &str,
    result: Result<(ObjectRef<K>, Action), controller::Error<E, watcher::Error>>,
) {
    match result {
        Ok((object, _)) => debug!(controller = controller_name, %object, "reconciled"),
        Err(controller::Error::ReconcilerFailed(err, object)) => error!(
            controller = controller_name,
            %object,
            category = err.category(),
            error = &err as &dyn std::error::Error,
            "failed to reconcile"
        ),
        Err(controller::Error::ObjectNotFound(object)) => {
            debug!(controller = controller_name, %object, "object is gone, nothing to reconcile")
        }
        Err(err) => error!(
            controller = controller_name,
            error = &err as &dyn std::error::Error,
            "controller failed"
        ),
    }
}
