use crate::auth::password::hash_password;
use crate::error::AppError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// 用户角色（封闭枚举，授权检查处穷举匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 管理员：用户管理、fail2ban 管理
    Admin,
    /// 申请人：提交卡证申请
    Requester,
    /// 窗口（appel）：推进申请状态
    Appel,
}

impl Role {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "requester" => Some(Role::Requester),
            "appel" => Some(Role::Appel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Requester => "requester",
            Role::Appel => "appel",
        }
    }
}

/// 持久化的用户记录（含密码哈希，绝不直接返回给客户端）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub password_hash: String,
    pub created_at: String,
    pub updated_at: String,
}

/// 用户的安全投影（响应体中使用）
#[derive(Debug, Clone, Serialize)]
pub struct SafeUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for SafeUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

/// 用户存储 - data/users.json 扁平文件
///
/// 每次操作完整读取、内存修改、完整重写，便于人工编辑和外部工具直改文件。
pub struct UserStore {
    users_file: PathBuf,
    // 进程内串行化 读-改-写，避免并发写互相覆盖
    write_lock: Mutex<()>,
}

impl UserStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            users_file: data_dir.join("users.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// 读取全部用户；文件缺失或损坏时按空列表处理（只记日志，不向上抛错）
    async fn read_all(&self) -> Vec<User> {
        match tokio::fs::read_to_string(&self.users_file).await {
            Ok(raw) => match serde_json::from_str::<Vec<User>>(&raw) {
                Ok(users) => users,
                Err(e) => {
                    tracing::warn!(error = %e, "用户文件解析失败，按空列表处理");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    async fn write_all(&self, users: &[User]) -> Result<(), AppError> {
        if let Some(parent) = self.users_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(users)
            .map_err(|e| AppError::InternalError(format!("序列化用户数据失败: {}", e)))?;
        tokio::fs::write(&self.users_file, content).await?;
        Ok(())
    }

    /// 按邮箱查找（大小写不敏感），用于登录验证
    pub async fn get_by_email(&self, email: &str) -> Option<User> {
        let needle = email.to_lowercase();
        self.read_all()
            .await
            .into_iter()
            .find(|u| u.email.to_lowercase() == needle)
    }

    pub async fn get_by_id(&self, id: i64) -> Option<User> {
        self.read_all().await.into_iter().find(|u| u.id == id)
    }

    /// 创建用户；邮箱重复返回 Conflict
    pub async fn create(
        &self,
        name: &str,
        email: &str,
        role: Role,
        password: &str,
    ) -> Result<SafeUser, AppError> {
        let _guard = self.write_lock.lock().await;

        let mut users = self.read_all().await;
        let email_lower = email.to_lowercase();
        if users.iter().any(|u| u.email.to_lowercase() == email_lower) {
            return Err(AppError::Conflict("该邮箱已被使用".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let next_id = users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        let user = User {
            id: next_id,
            name: name.to_string(),
            email: email.to_string(),
            role,
            password_hash: hash_password(password)?,
            created_at: now.clone(),
            updated_at: now,
        };

        let safe = SafeUser::from(&user);
        users.push(user);
        self.write_all(&users).await?;

        tracing::info!("用户 {} ({}) 已创建", safe.email, safe.role.as_str());
        Ok(safe)
    }

    /// 修改密码；返回用户是否存在
    pub async fn update_password(&self, id: i64, password: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;

        let mut users = self.read_all().await;
        let Some(user) = users.iter_mut().find(|u| u.id == id) else {
            return Ok(false);
        };

        user.password_hash = hash_password(password)?;
        user.updated_at = Utc::now().to_rfc3339();
        self.write_all(&users).await?;

        tracing::info!("用户 #{} 密码已更新", id);
        Ok(true)
    }

    /// 首次启动时播种管理员账号（用户文件为空才会执行）
    ///
    /// 邮箱/密码可用 ADMIN_DEFAULT_EMAIL / ADMIN_DEFAULT_PASSWORD 覆盖。
    pub async fn seed_admin_if_empty(&self) -> Result<Option<SafeUser>, AppError> {
        if !self.read_all().await.is_empty() {
            return Ok(None);
        }

        let email = std::env::var("ADMIN_DEFAULT_EMAIL")
            .unwrap_or_else(|_| "admin@example.com".to_string());
        let password =
            std::env::var("ADMIN_DEFAULT_PASSWORD").unwrap_or_else(|_| "admin123".to_string());

        let admin = self.create("Admin", &email, Role::Admin, &password).await?;
        tracing::warn!("⚠️  已创建默认管理员 {}，请尽快修改初始密码", admin.email);
        Ok(Some(admin))
    }
}
