//! Group and connection edits on a run.
//!
//! The adjacency matrix always stays (groups+1)² with the bias last. Removing
//! a group leaves stale references in phase items; they are skipped when code
//! is generated. Removing a group-to-group connection prunes it from every
//! phase item immediately.

use super::types::*;

impl Run {
    /// Give an empty adjacency its default shape (bias feeds every group).
    pub fn normalize_adjacency(&mut self) {
        if self.adjacency.is_empty() {
            self.adjacency = Adjacency::with_bias(self.groups.len());
        }
    }

    /// Append a group, connected from the bias. Returns its index.
    pub fn add_group(&mut self, group: Group) -> Result<usize, String> {
        check_group_name(&group.name)?;
        if self.group_index(&group.name).is_some() {
            return Err(format!("group '{}' already exists in run '{}'", group.name, self.name));
        }
        self.normalize_adjacency();
        let index = self.groups.len();
        self.groups.push(group);
        self.adjacency.insert(index);
        self.adjacency.set(index + 1, index, true);
        Ok(index)
    }

    /// Remove a group and its row and column.
    pub fn remove_group(&mut self, name: &str) -> Result<Group, String> {
        let index = self
            .group_index(name)
            .ok_or_else(|| format!("run '{}' has no group '{}'", self.name, name))?;
        self.adjacency.remove(index);
        Ok(self.groups.remove(index))
    }

    /// Rename a group and every phase-item reference to it.
    pub fn rename_group(&mut self, old: &str, new: &str) -> Result<(), String> {
        check_group_name(new)?;
        let index = self
            .group_index(old)
            .ok_or_else(|| format!("run '{}' has no group '{}'", self.name, old))?;
        if old == new {
            return Ok(());
        }
        if self.group_index(new).is_some() {
            return Err(format!("group '{}' already exists in run '{}'", new, self.name));
        }
        self.groups[index].name = new.to_string();

        let group = |g: &String| if g == old { new.to_string() } else { g.clone() };
        let conn = |c: &String| match split_connection(c) {
            Some((a, b)) if a == old || b == old => {
                connection_name(if a == old { new } else { a }, if b == old { new } else { b })
            }
            _ => c.clone(),
        };
        for phase in &mut self.phases {
            for item in &mut phase.items {
                item.components.groups = item.components.groups.iter().map(group).collect();
                item.components.connections = item.components.connections.iter().map(conn).collect();
                item.recording = item.recording.drain(..).map(|(g, t)| (group(&g), t)).collect();
                item.noise.activation = item.noise.activation.drain(..).map(|(g, v)| (group(&g), v)).collect();
                item.noise.input = item.noise.input.drain(..).map(|(g, v)| (group(&g), v)).collect();
                item.noise.weight = item.noise.weight.drain(..).map(|(c, w)| (conn(&c), w)).collect();
            }
        }
        Ok(())
    }

    /// Connect `from` to `to`. `from` may be the bias.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), String> {
        let (i, j) = self.endpoints(from, to)?;
        self.adjacency.set(i, j, true);
        Ok(())
    }

    /// Disconnect `from` from `to`, pruning the connection from phase items.
    pub fn disconnect(&mut self, from: &str, to: &str) -> Result<(), String> {
        let (i, j) = self.endpoints(from, to)?;
        self.adjacency.set(i, j, false);
        if i < self.groups.len() {
            let conn = connection_name(from, to);
            for phase in &mut self.phases {
                for item in &mut phase.items {
                    item.components.connections.shift_remove(&conn);
                }
            }
        }
        Ok(())
    }

    fn endpoints(&self, from: &str, to: &str) -> Result<(usize, usize), String> {
        let i = if from == BIAS_NAME {
            self.groups.len()
        } else {
            self.group_index(from)
                .ok_or_else(|| format!("run '{}' has no group '{}'", self.name, from))?
        };
        let j = self
            .group_index(to)
            .ok_or_else(|| format!("run '{}' has no group '{}' (connections cannot target the bias)", self.name, to))?;
        Ok((i, j))
    }
}

fn check_group_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("group name must not be empty".to_string());
    }
    if name.contains(CONNECTION_SEP) {
        return Err(format!("group name '{}' must not contain '{}'", name, CONNECTION_SEP));
    }
    if name == BIAS_NAME {
        return Err(format!("'{}' is reserved for the bias node", BIAS_NAME));
    }
    Ok(())
}
