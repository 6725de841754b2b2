// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use nuntius::{
  common::config::GatewayConfig, util, AppId, PublicId, Session, TcpGatewayConnector,
};
use std::{path::PathBuf, sync::Arc};

use util::validators::{validate_existing_file, validate_identifier, validate_socketaddr};

mod connect;
mod listen;
mod register;

/// Who a session authenticates as
#[derive(Clone)]
pub struct Identity {
  pub app_id: AppId,
  pub public_id: PublicId,
  pub secret: Vec<u8>,
}

impl std::fmt::Debug for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Identity")
      .field("app_id", &self.app_id)
      .field("public_id", &self.public_id)
      .finish_non_exhaustive()
  }
}

fn identity_args(command: Command<'static>) -> Command<'static> {
  command
    .arg(
      Arg::new("app")
        .help("Application the identity belongs to")
        .long("app")
        .short('a')
        .validator(validate_identifier)
        .takes_value(true)
        .required(true),
    )
    .arg(
      Arg::new("id")
        .help("Public id to register or authenticate as")
        .long("id")
        .short('i')
        .validator(validate_identifier)
        .takes_value(true)
        .required(true),
    )
}

fn app() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("gateway")
        .help("Gateway address, overriding the config file")
        .long("gateway")
        .short('g')
        .global(true)
        .validator(validate_socketaddr)
        .takes_value(true),
    )
    .arg(
      Arg::new("config")
        .help("JSON gateway configuration file")
        .long("config")
        .short('c')
        .global(true)
        .validator(validate_existing_file)
        .takes_value(true),
    )
    .subcommand(
      identity_args(Command::new("register").about("Register a public id and receive its secret"))
        .arg(
          Arg::new("key-file")
            .help("File holding the application's registration key")
            .long("key-file")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("out")
            .help("Write the issued secret here instead of printing it")
            .long("out")
            .short('o')
            .takes_value(true),
        ),
    )
    .subcommand(
      identity_args(
        Command::new("connect").about("Connect to a peer and pipe stdin and stdout over the stream"),
      )
      .arg(secret_arg())
      .arg(
        Arg::new("peer")
          .help("Public id of the peer to connect to")
          .validator(validate_identifier)
          .takes_value(true)
          .required(true),
      ),
    )
    .subcommand(
      identity_args(Command::new("listen").about("Accept every inbound connection and echo it back"))
        .arg(secret_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true)
}

fn secret_arg() -> Arg<'static> {
  Arg::new("secret-file")
    .help("File holding the secret issued at registration")
    .long("secret-file")
    .short('s')
    .validator(validate_existing_file)
    .takes_value(true)
    .required(true)
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nuntius=info,nuntius_cli=info"));
  // stdout carries peer data in `connect` mode
  let collector = tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = app().get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn gateway_config(args: &'_ ArgMatches) -> Result<GatewayConfig> {
  let mut config = match args.value_of("config") {
    Some(path) => GatewayConfig::load(path).context("Failed loading gateway config")?,
    None => GatewayConfig::default(),
  };
  if let Some(gateway) = args.value_of("gateway") {
    config.gateway_address = gateway.into();
  }
  config.validate()?;
  Ok(config)
}

fn read_file(args: &'_ ArgMatches, name: &str) -> Result<Vec<u8>> {
  let path = PathBuf::from(
    args
      .value_of(name)
      .with_context(|| format!("{} argument is required", name))?,
  );
  std::fs::read(&path).with_context(|| format!("Failed reading {}", path.display()))
}

pub fn identity_arg_handling(args: &'_ ArgMatches) -> Result<Identity> {
  Ok(Identity {
    app_id: AppId::new(args.value_of("app").context("app argument is required")?),
    public_id: PublicId::new(args.value_of("id").context("id argument is required")?),
    secret: read_file(args, "secret-file")?,
  })
}

/// Opens a session to the configured gateway and waits for its handshake
pub async fn open_session(config: Arc<GatewayConfig>) -> Result<Session> {
  let connector = TcpGatewayConnector::new(config.gateway_address.clone()).with_nodelay(config.nodelay);
  let session = Session::connect(Arc::clone(&config), Arc::new(connector))
    .await
    .with_context(|| format!("Failed reaching gateway at {}", config.gateway_address))?;
  session.ready().await.context("Gateway handshake failed")?;
  Ok(session)
}

pub async fn open_authenticated(config: Arc<GatewayConfig>, identity: &Identity) -> Result<Session> {
  let session = open_session(config).await?;
  session
    .authenticate(
      identity.app_id.clone(),
      identity.public_id.clone(),
      identity.secret.clone(),
    )
    .await
    .context("Authentication failed")?;
  tracing::info!(id = %identity.public_id, "authenticated");
  Ok(session)
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let (mode, opts) = matches
    .subcommand()
    .context("Subcommand is marked as required")?;
  let config = Arc::new(gateway_config(opts)?);
  match mode {
    "register" => {
      let args = register::RegisterArgs {
        app_id: AppId::new(opts.value_of("app").context("app argument is required")?),
        public_id: PublicId::new(opts.value_of("id").context("id argument is required")?),
        registration_key: read_file(opts, "key-file")?,
        output: opts.value_of("out").map(PathBuf::from),
      };
      tracing::info!(gateway = %config.gateway_address, id = %args.public_id, "registering");
      register::register_main(config, args).await
    }
    "connect" => {
      let args = connect::ConnectArgs {
        identity: identity_arg_handling(opts)?,
        peer: PublicId::new(opts.value_of("peer").context("peer argument is required")?),
      };
      tracing::info!("Running connect with {:?}", args);
      connect::connect_main(config, args).await
    }
    "listen" => {
      let identity = identity_arg_handling(opts)?;
      tracing::info!("Running listen with {:?}", identity);
      listen::listen_main(config, identity).await
    }
    _ => unreachable!(),
  }
}

#[cfg(test)]
mod tests {
  use super::{app, gateway_config};

  #[test]
  fn command_definition_is_consistent() {
    app().debug_assert();
  }

  #[test]
  fn every_subcommand_argument_is_described() {
    for command in app().get_subcommands() {
      for arg in command.get_arguments() {
        assert!(
          arg.get_help().is_some(),
          "{} --{} has no help text",
          command.get_name(),
          arg.get_id()
        );
      }
    }
  }

  #[test]
  fn gateway_override_applies_to_subcommands() {
    let matches = app()
      .try_get_matches_from(vec!["nuntius", "listen", "-a", "app", "-i", "bob", "-s", "Cargo.toml", "-g", "127.0.0.1:9999"])
      .unwrap();
    let (mode, opts) = matches.subcommand().unwrap();
    assert_eq!(mode, "listen");
    assert_eq!(gateway_config(opts).unwrap().gateway_address, "127.0.0.1:9999");
  }

  #[test]
  fn connect_requires_peer() {
    assert!(app()
      .try_get_matches_from(vec!["nuntius", "connect", "-a", "app", "-i", "alice", "-s", "Cargo.toml"])
      .is_err());
  }
}
