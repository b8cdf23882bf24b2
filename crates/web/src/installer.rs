//! Installation keys and the Windows deployment script
//!
//! The script installs TightVNC silently with the shared secret and then
//! calls back `/api/register-machine` with its installation key.

/// 128-bit random key, hex encoded
pub fn generate_installation_key() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Download filename for an endpoint's installer
pub fn script_filename(endpoint_id: &str) -> String {
    let short: String = endpoint_id.chars().take(8).collect();
    format!("vnc_installer_{}.ps1", short)
}

/// Render the PowerShell installer for one installation key
pub fn powershell_script(installation_key: &str, secret: &str, server_url: &str) -> String {
    let server_url = server_url.trim_end_matches('/');
    format!(
        r#"# VNC Auto-Installation Script
# Installation Key: {key}

$VNC_PASSWORD = "{secret}"
$INSTALLATION_KEY = "{key}"
$SERVER_URL = "{server_url}"

Write-Host "Starting VNC Installation..." -ForegroundColor Green

$TightVNC_URL = "https://www.tightvnc.com/download/2.8.59/tightvnc-2.8.59-gpl-setup-64bit.msi"
$TempPath = "$env:TEMP\tightvnc-setup.msi"

try {{
    Write-Host "Downloading TightVNC..." -ForegroundColor Yellow
    Invoke-WebRequest -Uri $TightVNC_URL -OutFile $TempPath -UseBasicParsing

    Write-Host "Installing TightVNC..." -ForegroundColor Yellow
    Start-Process msiexec.exe -ArgumentList "/i `"$TempPath`" /quiet /norestart SET_USEVNCAUTHENTICATION=1 SET_PASSWORD=$VNC_PASSWORD SET_USECONTROLAUTHENTICATION=1 SET_CONTROLPASSWORD=$VNC_PASSWORD" -Wait

    Write-Host "Starting VNC Service..." -ForegroundColor Yellow
    Start-Service -Name "tvnserver"
    Set-Service -Name "tvnserver" -StartupType Automatic

    Write-Host "Registering with management server..." -ForegroundColor Yellow
    $MachineName = $env:COMPUTERNAME
    $IPAddress = (Get-NetIPAddress -AddressFamily IPv4 | Where-Object {{$_.PrefixOrigin -eq "Dhcp" -or $_.PrefixOrigin -eq "Manual"}} | Select-Object -First 1).IPAddress

    $RegistrationData = @{{
        installation_key = $INSTALLATION_KEY
        machine_name = $MachineName
        ip_address = $IPAddress
        status = "active"
    }}
    $JsonData = ConvertTo-Json $RegistrationData

    try {{
        Invoke-RestMethod -Uri "$SERVER_URL/api/register-machine" -Method POST -Body $JsonData -ContentType "application/json"
        Write-Host "Registration successful!" -ForegroundColor Green
    }} catch {{
        Write-Host "Registration failed, but VNC is installed and running" -ForegroundColor Yellow
    }}

    Remove-Item $TempPath -Force -ErrorAction SilentlyContinue
    Write-Host "VNC Installation completed successfully!" -ForegroundColor Green
}} catch {{
    Write-Host "Installation failed: $_" -ForegroundColor Red
    exit 1
}}

try {{
    Set-ItemProperty -Path "HKLM:\SOFTWARE\TightVNC\Server" -Name "ShowTrayIcon" -Value 0
}} catch {{
    Write-Host "Could not hide tray icon" -ForegroundColor Yellow
}}
"#,
        key = installation_key,
        secret = secret,
        server_url = server_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_are_unique_hex() {
        let keys: HashSet<String> = (0..256).map(|_| generate_installation_key()).collect();
        assert_eq!(keys.len(), 256);
        for key in &keys {
            assert_eq!(key.len(), 32);
            assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_script_embeds_key_and_callback() {
        let script = powershell_script("abc123", "s3cret", "http://mgmt.local:8001/");
        assert!(script.contains("$INSTALLATION_KEY = \"abc123\""));
        assert!(script.contains("$VNC_PASSWORD = \"s3cret\""));
        assert!(script.contains("$SERVER_URL = \"http://mgmt.local:8001\""));
        assert!(script.contains("$SERVER_URL/api/register-machine"));
    }

    #[test]
    fn test_script_filename() {
        assert_eq!(
            script_filename("0f3c9a2e-1111-2222-3333-444455556666"),
            "vnc_installer_0f3c9a2e.ps1"
        );
        assert_eq!(script_filename("abc"), "vnc_installer_abc.ps1");
    }
}
