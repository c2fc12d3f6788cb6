//! Reload supervisor: the single writer of the live route table.
//!
//! One event loop consumes repository change events, admin mutations and the
//! stop signal. Every accepted change mutates a working [`Configuration`]
//! copy; when the result structurally differs from what is live, a fresh
//! [`RouteTable`] is compiled and the dispatcher pointer swapped atomically.
//! In-flight requests keep the snapshot they started with. Admin changes stay
//! in memory until `ApplySources` asks the repository to persist them.
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::{
    adapters::router::{Dispatcher, RouteTable},
    admin::{AdminMessage, ChangeMessage},
    config::models::ServiceConfig,
    core::pipeline::ProxyFactory,
    ports::repository::{
        Configuration, ConfigurationState, RepoChangeEvent, RepositoryError, Repository,
    },
};

pub struct ReloadSupervisor {
    service: ServiceConfig,
    repository: Arc<dyn Repository>,
    dispatcher: Arc<Dispatcher>,
    factory: Arc<ProxyFactory>,
    current: Configuration,
    /// Read-only snapshot shared with the admin API.
    view: Arc<RwLock<Configuration>>,
    admin_rx: mpsc::Receiver<AdminMessage>,
    repo_rx: Option<mpsc::Receiver<RepoChangeEvent>>,
    stop_rx: mpsc::Receiver<()>,
}

impl ReloadSupervisor {
    /// Load the initial configuration, compile the first snapshot and return
    /// the ready-to-run supervisor.
    pub async fn new(
        service: ServiceConfig,
        repository: Arc<dyn Repository>,
        factory: Arc<ProxyFactory>,
        admin_rx: mpsc::Receiver<AdminMessage>,
        stop_rx: mpsc::Receiver<()>,
    ) -> eyre::Result<(Self, Arc<Dispatcher>, Arc<RwLock<Configuration>>)> {
        let maps = repository.find_all().await?;
        let current = Configuration::new(maps);
        current.validate()?;

        let table = RouteTable::build(&current, &factory)?;
        tracing::info!(endpoints = table.endpoint_count(), "initial route table built");
        let dispatcher = Dispatcher::new(table);
        let view = Arc::new(RwLock::new(current.clone()));
        let repo_rx = repository.watch();

        let supervisor = Self {
            service,
            repository,
            dispatcher: dispatcher.clone(),
            factory,
            current,
            view: view.clone(),
            admin_rx,
            repo_rx,
            stop_rx,
        };
        Ok((supervisor, dispatcher, view))
    }

    /// Run the event loop until the stop channel fires or every input closes.
    pub async fn run(mut self) {
        enum Event {
            Stop,
            Repo(Option<RepoChangeEvent>),
            Admin(Option<AdminMessage>),
        }

        tracing::info!("reload supervisor started");
        loop {
            let event = {
                let repo_rx = &mut self.repo_rx;
                let admin_rx = &mut self.admin_rx;
                let stop_rx = &mut self.stop_rx;
                tokio::select! {
                    _ = stop_rx.recv() => Event::Stop,
                    // A passive repository contributes a never-ready branch.
                    event = async {
                        match repo_rx {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Event::Repo(event),
                    message = admin_rx.recv() => Event::Admin(message),
                }
            };

            match event {
                Event::Stop => {
                    tracing::info!("reload supervisor stopping");
                    break;
                }
                Event::Repo(Some(event)) => self.handle_repo_event(event),
                Event::Repo(None) => {
                    tracing::warn!("repository watcher closed");
                    self.repo_rx = None;
                }
                Event::Admin(Some(message)) => self.handle_admin_message(message).await,
                Event::Admin(None) => {
                    tracing::warn!("admin channel closed");
                    break;
                }
            }
        }
    }

    /// An external change already persisted in the repository: fold the new
    /// group content into the working copy and republish.
    fn handle_repo_event(&mut self, event: RepoChangeEvent) {
        tracing::info!(group = %event.group, state = ?event.state, "repository change received");

        let mut candidate = self.current.clone();
        match event.state {
            ConfigurationState::Removed => {
                candidate
                    .definition_maps
                    .retain(|dm| !dm.name.eq_ignore_ascii_case(&event.group));
            }
            _ => match candidate.group_mut(&event.group) {
                Some(dm) => {
                    dm.definitions = event.definitions;
                    dm.state = ConfigurationState::None;
                }
                None => {
                    let mut dm = crate::ports::repository::DefinitionMap::new(&event.group);
                    dm.definitions = event.definitions;
                    candidate.definition_maps.push(dm);
                }
            },
        }

        if let Err(e) = candidate.validate() {
            tracing::error!(group = %event.group, error = %e, "rejected repository change");
            return;
        }
        self.publish(candidate);
    }

    async fn handle_admin_message(&mut self, message: AdminMessage) {
        let result = self.apply_admin_change(message.change).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "admin change rejected");
        }
        let _ = message.reply.send(result);
    }

    async fn apply_admin_change(
        &mut self,
        change: ChangeMessage,
    ) -> Result<(), RepositoryError> {
        let mut candidate = self.current.clone();
        match change {
            ChangeMessage::Added {
                source,
                mut definition,
            } => {
                definition.inherit_from_service(&self.service);
                candidate.add_definition(&source, definition)?;
            }
            ChangeMessage::Updated {
                source,
                mut definition,
            } => {
                definition.inherit_from_service(&self.service);
                candidate.update_definition(&source, definition)?;
            }
            ChangeMessage::Removed {
                source,
                definition_name,
            } => {
                candidate.remove_definition(&source, &definition_name)?;
            }
            ChangeMessage::AddedSource { source } => {
                candidate.add_group(&source)?;
            }
            ChangeMessage::RemovedSource { source } => {
                candidate.remove_group(&source)?;
            }
            ChangeMessage::ApplySources => {
                self.repository
                    .write(&mut candidate.definition_maps)
                    .await?;
                candidate.compact();
            }
        }

        self.publish(candidate);
        Ok(())
    }

    /// Swap the dispatcher to a new snapshot unless the candidate is
    /// structurally identical to what is already live.
    fn publish(&mut self, candidate: Configuration) {
        if self.current.equals_to(&candidate) {
            // State flags may still have moved (e.g. after a persist).
            self.current = candidate;
            self.refresh_view();
            tracing::debug!("configuration unchanged, skipping swap");
            return;
        }

        match RouteTable::build(&candidate, &self.factory) {
            Ok(table) => {
                tracing::info!(endpoints = table.endpoint_count(), "publishing new route table");
                self.dispatcher.swap(table);
                self.current = candidate;
                self.refresh_view();
            }
            Err(e) => {
                tracing::error!(error = %e, "route table build failed, keeping previous snapshot");
            }
        }
    }

    fn refresh_view(&self) {
        *self.view.write().expect("configuration view lock") = self.current.clone();
    }
}
