//! Template node: fill `{variable}` slots, emit the rendered text on
//! trigger.
//!
//! Each distinct `{variable}` in the template becomes its own input port;
//! the latest value per slot is held until a `trigger` message renders the
//! whole template. Unfilled slots render empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::message::Message;
use crate::router::{PortAddress, Router};
use crate::store::{NodeKind, NodeStore};

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// Distinct variable names in template order.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in VARIABLE.captures_iter(template) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Render with the given values; missing slots become empty strings.
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    VARIABLE
        .replace_all(template, |cap: &regex::Captures<'_>| {
            values.get(&cap[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// The controller. One instance serves every template node.
pub struct TemplateController {
    router: Arc<Router>,
    store: NodeStore,
    values: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
}

impl TemplateController {
    pub fn new(router: Arc<Router>, store: NodeStore) -> Arc<Self> {
        Arc::new(Self {
            router,
            store,
            values: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn template_of(&self, node_id: &str) -> String {
        self.store
            .ensure(node_id, NodeKind::Template)
            .config
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    /// Register `trigger` plus one dynamically created port per variable.
    pub fn attach(self: &Arc<Self>, node_id: &str) {
        let template = self.template_of(node_id);
        self.values
            .lock()
            .unwrap()
            .insert(node_id.to_string(), HashMap::new());

        for var in template_variables(&template) {
            let values = Arc::clone(&self.values);
            let id = node_id.to_string();
            let name = var.clone();
            self.router.register(
                PortAddress::input(node_id, &var),
                Arc::new(move |msg: &Message| {
                    values
                        .lock()
                        .unwrap()
                        .entry(id.clone())
                        .or_default()
                        .insert(name.clone(), msg.display_text());
                    Ok(())
                }),
            );
        }

        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        self.router.register(
            PortAddress::input(node_id, "trigger"),
            Arc::new(move |_msg: &Message| {
                let template = ctl.template_of(&id);
                let rendered = {
                    let values = ctl.values.lock().unwrap();
                    render(&template, values.get(&id).unwrap_or(&HashMap::new()))
                };
                ctl.router
                    .send_from(&id, "text", Message::text(&id, rendered));
                Ok(())
            }),
        );
    }

    /// Drop the node's ports and held values.
    pub fn detach(&self, node_id: &str) {
        let template = self.template_of(node_id);
        for var in template_variables(&template) {
            self.router.unregister(&PortAddress::input(node_id, &var));
        }
        self.router
            .unregister(&PortAddress::input(node_id, "trigger"));
        self.values.lock().unwrap().remove(node_id);
    }
}
