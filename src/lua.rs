// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub move_member: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        let move_member = Script::new(include_str!("./lua/move_member.lua"));

        Self { move_member }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LuaScripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaScripts")
            .field("move_member", &self.move_member.get_hash())
            .finish()
    }
}
