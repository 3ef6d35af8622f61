use std::path::{Path, PathBuf};

use cert_manager_plugin::{
    controller::{self, Clients},
    translate::IdentityMapper,
    APP_NAME, FIELD_MANAGER,
};
use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    kube::{
        self,
        config::{KubeConfigOptions, Kubeconfig},
    },
    logging::TracingTarget,
};

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Sync cert-manager objects until terminated
    Run(PluginRun),
}

#[derive(clap::Parser)]
struct PluginRun {
    /// Namespace of the host cluster that the vcluster syncs into
    #[clap(long, env)]
    target_namespace: String,
    /// Name of the vcluster, used to tell its host objects apart from those of other vclusters
    #[clap(long, env)]
    vcluster_name: String,
    /// Kubeconfig of the host cluster, the in-cluster config is used if unset
    #[clap(long, env)]
    host_kubeconfig: Option<PathBuf>,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

async fn host_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            kube::Config::from_custom_kubeconfig(
                Kubeconfig::read_from(path)?,
                &KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::incluster()?,
    };
    Ok(kube::Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(PluginRun {
            target_namespace,
            vcluster_name,
            host_kubeconfig,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "CERT_MANAGER_PLUGIN_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let virtual_client =
                stackable_operator::client::create_client(Some(FIELD_MANAGER.to_string())).await?;
            let host_client = host_client(host_kubeconfig.as_deref()).await?;
            tracing::info!(
                host.namespace = %target_namespace,
                vcluster.name = %vcluster_name,
                "starting controllers"
            );
            controller::start(
                Clients {
                    virtual_client: virtual_client.as_kube_client(),
                    host_client,
                    field_manager: FIELD_MANAGER.to_string(),
                },
                IdentityMapper::new(target_namespace, vcluster_name),
            )
            .await;
        }
    }
    Ok(())
}
